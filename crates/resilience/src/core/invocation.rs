//! A unit of work and the outcome of running it under a policy chain.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{BoxError, ResilienceError};
use super::result::ResilienceResult;

type WorkFn<T> = dyn Fn(AttemptContext) -> BoxFuture<'static, ResilienceResult<T>> + Send + Sync;

/// Per-attempt view handed to the unit of work.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    attempt: u32,
    cancellation: CancellationToken,
}

impl AttemptContext {
    /// Context for a standalone call outside a chain.
    #[must_use]
    pub fn new(attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            attempt,
            cancellation,
        }
    }

    /// 1-based attempt number within the invocation.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token cancelled when this attempt is abandoned (timeout) or the
    /// invocation is cancelled by its caller.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Shorthand for `cancellation().is_cancelled()`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// One execution of a unit of work.
///
/// The work is a repeatable callable: retry runs it once per attempt, so it
/// must be safe to execute more than once.
pub struct Invocation<T> {
    work: Arc<WorkFn<T>>,
    cancellation: CancellationToken,
    attempts: AtomicU32,
    started_at: Instant,
}

impl<T> std::fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Invocation<T> {
    /// Asynchronous unit of work.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        Self {
            work: Arc::new(move |ctx| Box::pin(work(ctx))),
            cancellation: CancellationToken::new(),
            attempts: AtomicU32::new(0),
            started_at: Instant::now(),
        }
    }

    /// Synchronous unit of work, run on tokio's blocking pool.
    ///
    /// When an attempt is abandoned the closure keeps running on its
    /// blocking thread; its result is discarded. Long-running work should
    /// poll [`AttemptContext::is_cancelled`].
    pub fn blocking<F, E>(work: F) -> Self
    where
        F: Fn(&AttemptContext) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let work = Arc::new(work);
        Self::new(move |ctx| {
            let work = Arc::clone(&work);
            async move {
                tokio::task::spawn_blocking(move || work(&ctx))
                    .await
                    .map_err(ResilienceError::operation)?
                    .map_err(ResilienceError::operation)
            }
        })
    }

    /// Attach a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token observed by every layer of the chain.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Time since the invocation was created.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Instant::now();
    }

    /// Start one attempt of the unit of work.
    pub(crate) fn attempt(&self, cancellation: CancellationToken) -> BoxFuture<'static, ResilienceResult<T>> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        (self.work)(AttemptContext::new(attempt, cancellation))
    }
}

/// Terminal result of one invocation; exactly one per call.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The work (or a fallback) produced a value.
    Success(T),
    /// The chain failed.
    Failure(ResilienceError),
    /// The caller cancelled the invocation.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether the outcome is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the outcome is a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Whether the invocation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The failure, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&ResilienceError> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Convert into a result; cancellation maps to [`ResilienceError::Cancelled`].
    pub fn into_result(self) -> ResilienceResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(error),
            Self::Cancelled => Err(ResilienceError::Cancelled),
        }
    }
}

impl<T> From<ResilienceResult<T>> for Outcome<T> {
    fn from(result: ResilienceResult<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(ResilienceError::Cancelled) => Self::Cancelled,
            Err(error) => Self::Failure(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attempts_are_numbered_from_one() {
        let invocation = Invocation::new(|ctx: AttemptContext| async move { Ok(ctx.attempt()) });

        let first = invocation.attempt(CancellationToken::new()).await.unwrap();
        let second = invocation.attempt(CancellationToken::new()).await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(invocation.attempts(), 2);
    }

    #[tokio::test]
    async fn blocking_work_runs_off_the_runtime() {
        let invocation = Invocation::blocking(|_ctx: &AttemptContext| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok::<_, std::io::Error>("done")
        });

        let value = invocation.attempt(CancellationToken::new()).await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn blocking_errors_become_operation_failures() {
        let invocation = Invocation::<()>::blocking(|_ctx: &AttemptContext| {
            Err(std::io::Error::other("disk gone"))
        });

        let err = invocation.attempt(CancellationToken::new()).await.unwrap_err();
        assert!(err.downcast_ref::<std::io::Error>().is_some());
    }

    fn failing_blocking<E>(make: fn() -> E) -> Invocation<()>
    where
        E: Into<BoxError> + Send + 'static,
    {
        Invocation::blocking(move |_ctx: &AttemptContext| Err(make()))
    }

    #[tokio::test]
    async fn blocking_accepts_any_sendable_error() {
        let from_string = failing_blocking(|| String::from("quota exceeded"));
        let err = from_string.attempt(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");

        let from_str = failing_blocking(|| "read-only");
        let err = from_str.attempt(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "read-only");
    }

    #[test]
    fn cancelled_error_maps_to_cancelled_outcome() {
        let outcome: Outcome<()> = Err(ResilienceError::Cancelled).into();
        assert!(outcome.is_cancelled());
        assert!(outcome.into_result().unwrap_err().is_cancelled());
    }
}
