//! Fallback: substitute a result when the protected call finally fails.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::core::{ErrorPredicate, ResilienceError, ResilienceResult};

type Handler<T> = dyn Fn(&ResilienceError) -> BoxFuture<'static, ResilienceResult<T>> + Send + Sync;

/// Produces a substitute value from the final failure.
///
/// Cancellation never triggers the fallback. When the fallback itself fails
/// the caller sees [`ResilienceError::FallbackFailed`] carrying both errors.
pub struct FallbackPolicy<T> {
    handler: Arc<Handler<T>>,
    apply_on: ErrorPredicate,
}

impl<T> Clone for FallbackPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            apply_on: self.apply_on.clone(),
        }
    }
}

impl<T> fmt::Debug for FallbackPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("apply_on", &self.apply_on)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> FallbackPolicy<T> {
    /// Fallback computed asynchronously from the failure.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(&ResilienceError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |error| Box::pin(handler(error))),
            apply_on: ErrorPredicate::always(),
        }
    }

    /// Fallback returning a fixed value.
    #[must_use]
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Only substitute for failures matching `predicate`; others propagate.
    #[must_use]
    pub fn apply_on(mut self, predicate: ErrorPredicate) -> Self {
        self.apply_on = predicate;
        self
    }

    /// Whether this failure would be replaced.
    #[must_use]
    pub fn applies_to(&self, error: &ResilienceError) -> bool {
        !error.is_cancelled() && self.apply_on.test(error)
    }

    /// Run `operation`, substituting the fallback on a matching failure.
    #[tracing::instrument(level = "debug", skip_all, fields(pattern = "fallback"))]
    pub async fn execute<F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        match operation().await {
            Ok(value) => Ok(value),
            Err(primary) if self.applies_to(&primary) => {
                debug!(error = %primary, "primary failed, running fallback");
                match (self.handler)(&primary).await {
                    Ok(value) => Ok(value),
                    Err(ResilienceError::Cancelled) => Err(ResilienceError::Cancelled),
                    Err(source) => Err(ResilienceError::FallbackFailed {
                        primary: Box::new(primary),
                        source: Box::new(source),
                    }),
                }
            }
            Err(error) => Err(error),
        }
    }
}
