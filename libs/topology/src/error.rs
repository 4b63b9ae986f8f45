//! Error types for graph loading

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Configuration error: the config file is empty")]
    ConfigEmpty,

    #[error("Malformed configuration: {message}")]
    ConfigMalformed { message: String },

    #[error("Graph too small: {message}")]
    GraphTooSmall { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TopologyError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::ConfigMalformed {
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for TopologyError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::malformed(e.to_string())
    }
}
