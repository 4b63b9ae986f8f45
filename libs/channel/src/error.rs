//! Channel error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Error, Debug)]
pub enum ChannelError {
    /// Non-blocking get found nothing queued. Expected control flow.
    #[error("Channel '{channel}' is empty")]
    Empty { channel: String },

    #[error("Channel '{channel}' is full (capacity {capacity})")]
    Full { channel: String, capacity: usize },

    #[error("Timed out after {timeout_ms}ms waiting on channel '{channel}'")]
    Timeout { channel: String, timeout_ms: u64 },

    #[error("Channel '{channel}' is closed")]
    Closed { channel: String },

    #[error("Bridge error on '{channel}': {message}")]
    Bridge { channel: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn bridge(channel: &str, message: impl Into<String>) -> Self {
        Self::Bridge {
            channel: channel.to_string(),
            message: message.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}
