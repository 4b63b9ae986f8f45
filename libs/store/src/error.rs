//! Error types for the object store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store allocation failed: {message}")]
    Allocation { message: String },

    #[error("Store is full: requested {requested} bytes, {available} bytes available")]
    Full { requested: u64, available: u64 },

    #[error("Store is closed")]
    Closed,

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Store lock held by pid {holder} for more than {waited_ms}ms")]
    LockTimeout { holder: u32, waited_ms: u64 },

    #[error("Store segment is corrupt: {message}")]
    Corrupt { message: String },

    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn allocation(message: impl Into<String>) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// True for conditions an actor can recover from by skipping a step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::NotFound { .. })
    }
}
