//! Signal Protocol
//!
//! Lifecycle commands flow from the supervisor to an actor over its signal
//! channel; acknowledgments and status flow back over its comm channel. Data
//! channels carry [`Message`]s, normally references to objects in the store
//! rather than the payloads themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use store::ObjectId;

/// Lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Run `setup` once and acknowledge with [`Comm::Ready`]
    Setup,
    /// Start stepping
    Run,
    /// Suspend stepping
    Pause,
    /// Continue stepping after a pause
    Resume,
    /// Suspend stepping and acknowledge with [`Comm::StopSuccess`]
    Stop,
    /// Leave the run loop, call `stop` and exit
    Quit,
}

impl Signal {
    pub const ALL: [Signal; 6] = [
        Signal::Setup,
        Signal::Run,
        Signal::Pause,
        Signal::Resume,
        Signal::Stop,
        Signal::Quit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Setup => "setup",
            Signal::Run => "run",
            Signal::Pause => "pause",
            Signal::Resume => "resume",
            Signal::Stop => "stop",
            Signal::Quit => "quit",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Signal::ALL
            .into_iter()
            .find(|signal| signal.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown signal '{s}'"))
    }
}

/// Lifecycle stage an actor error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Setup,
    Step,
    Stop,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Setup => "setup",
            Stage::Step => "step",
            Stage::Stop => "stop",
        })
    }
}

/// Actor to supervisor message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Comm {
    /// The actor's run loop is up and listening for signals
    Started,
    /// `setup` completed
    Ready,
    /// Acknowledges [`Signal::Stop`]
    StopSuccess,
    Error { stage: Stage, message: String },
    /// Free-form status text
    Status(String),
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comm::Started => f.write_str("started"),
            Comm::Ready => f.write_str("ready"),
            Comm::StopSuccess => f.write_str("stop success"),
            Comm::Error { stage, message } => write!(f, "error during {stage}: {message}"),
            Comm::Status(text) => f.write_str(text),
        }
    }
}

/// Data channel payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Objects in the store handed to the consumer
    Refs(Vec<ObjectId>),
    Text(String),
    Bytes(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_round_trip() {
        for signal in Signal::ALL {
            assert_eq!(signal.as_str().parse::<Signal>().unwrap(), signal);
        }
        assert_eq!(" RUN ".parse::<Signal>().unwrap(), Signal::Run);
        assert!("explode".parse::<Signal>().is_err());
    }

    #[test]
    fn test_comm_display() {
        assert_eq!(Comm::StopSuccess.to_string(), "stop success");
        let err = Comm::Error {
            stage: Stage::Setup,
            message: "no camera".into(),
        };
        assert_eq!(err.to_string(), "error during setup: no camera");
    }
}
