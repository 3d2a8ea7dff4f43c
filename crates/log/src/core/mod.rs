//! Error types

use thiserror::Error;

/// Result type for logger setup
pub type LogResult<T> = Result<T, LogError>;

/// Logger setup errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    /// The filter directive string could not be parsed.
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(String),
}
