//! Driver error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("DevTools protocol error: {0}")]
    Protocol(String),

    #[error("Browser is not running")]
    NotRunning,
}

impl From<DriverError> for mediator_core::MediatorError {
    fn from(err: DriverError) -> Self {
        mediator_core::MediatorError::Driver(err.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
