//! Supervisor error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NexusError>;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    #[error("Failed to launch '{actor}': {message}")]
    Launch { actor: String, message: String },

    #[error("Worker manifest error: {message}")]
    Manifest { message: String },

    #[error(transparent)]
    Topology(#[from] topology::TopologyError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Channel(#[from] channel::ChannelError),

    #[error(transparent)]
    Actor(#[from] actors::ActorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NexusError {
    pub fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    pub fn launch(actor: &str, message: impl Into<String>) -> Self {
        Self::Launch {
            actor: actor.to_string(),
            message: message.into(),
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}
