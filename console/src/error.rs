//! Console error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Invalid project name '{0}'. Use only alphanumeric characters, hyphens, and underscores")]
    InvalidName(String),

    #[error("Project '{0}' not found")]
    NotFound(String),

    #[error("Project '{0}' already exists")]
    AlreadyExists(String),

    #[error("Mediator error: {0}")]
    Mediator(#[from] mediator_core::MediatorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
