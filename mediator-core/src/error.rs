//! Error types for the mediation engine

use thiserror::Error;

/// Main error type for traffic mediation operations
#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Exchange {id} is not suspended")]
    NotSuspended { id: String },

    #[error("Malformed command: {0}")]
    Command(String),

    #[error("Malformed raw request: {0}")]
    RawRequest(String),

    #[error("Replay failed: {0}")]
    Replay(String),

    #[error("Replay cancelled")]
    ReplayCancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for mediation operations
pub type Result<T> = std::result::Result<T, MediatorError>;
