//! Supervisor-owned state: lifecycle, flags and per-actor status

use std::fmt;

use serde::Serialize;

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NexusState {
    #[default]
    Uninitialized,
    Constructed,
    Running,
    Stopped,
}

impl fmt::Display for NexusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NexusState::Uninitialized => "uninitialized",
            NexusState::Constructed => "constructed",
            NexusState::Running => "running",
            NexusState::Stopped => "stopped",
        })
    }
}

/// Per-actor status, transitioned only by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorState {
    #[default]
    Pending,
    Setup,
    Ready,
    Running,
    Stopped,
    Error,
}

impl ActorState {
    /// Setup acknowledged one way or the other.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ActorState::Pending | ActorState::Setup)
    }
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActorState::Pending => "pending",
            ActorState::Setup => "setup",
            ActorState::Ready => "ready",
            ActorState::Running => "running",
            ActorState::Stopped => "stopped",
            ActorState::Error => "error",
        })
    }
}

/// Pipeline-wide flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flags {
    /// Shutdown requested
    pub quit: bool,
    /// `run` has been broadcast
    pub run: bool,
    /// Every actor acknowledged setup
    pub load: bool,
}

impl Flags {
    pub const KEYS: [&'static str; 3] = ["quit", "run", "load"];

    pub fn keys(&self) -> [&'static str; 3] {
        Self::KEYS
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "quit" => Some(self.quit),
            "run" => Some(self.run),
            "load" => Some(self.load),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_keys_in_order() {
        let flags = Flags::default();
        assert_eq!(flags.keys(), ["quit", "run", "load"]);
        assert!(Flags::KEYS.iter().all(|key| flags.get(key) == Some(false)));
        assert_eq!(flags.get("bogus"), None);
    }

    #[test]
    fn test_settled_states() {
        assert!(!ActorState::Pending.is_settled());
        assert!(!ActorState::Setup.is_settled());
        assert!(ActorState::Ready.is_settled());
        assert!(ActorState::Error.is_settled());
    }
}
