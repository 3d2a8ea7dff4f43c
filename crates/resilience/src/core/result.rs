//! Result alias and conversion helpers

use std::fmt;

use super::error::ResilienceError;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Extension trait turning arbitrary results into [`ResilienceResult`]s.
pub trait ResultExt<T> {
    /// Wrap the error as an operation failure.
    fn into_resilience(self) -> ResilienceResult<T>;

    /// Wrap the error as an operation failure, prefixing a context message.
    fn with_context<C, F>(self, f: F) -> ResilienceResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_resilience(self) -> ResilienceResult<T> {
        self.map_err(ResilienceError::operation)
    }

    fn with_context<C, F>(self, f: F) -> ResilienceResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            ResilienceError::operation(ContextError {
                context: f().to_string(),
                source: Box::new(e),
            })
        })
    }
}

/// Operation error carrying a context message.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct ContextError {
    context: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ContextError {
    /// The context message.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }
}
