//! Actor error types

use channel::ChannelError;
use store::StoreError;
use thiserror::Error;
use topology::TopologyError;

pub type Result<T> = std::result::Result<T, ActorError>;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("Setup failed: {message}")]
    Setup { message: String },

    #[error("Step failed: {message}")]
    Step { message: String },

    #[error("Unknown actor class: {class}")]
    UnknownClass { class: String },

    #[error("Invalid parameters for '{actor}': {message}")]
    Params { actor: String, message: String },

    #[error("Actor '{actor}' has no '{port}' link")]
    MissingLink { actor: String, port: String },

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
}

impl ActorError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    pub fn step(message: impl Into<String>) -> Self {
        Self::Step {
            message: message.into(),
        }
    }

    pub fn params(actor: &str, message: impl Into<String>) -> Self {
        Self::Params {
            actor: actor.to_string(),
            message: message.into(),
        }
    }
}
