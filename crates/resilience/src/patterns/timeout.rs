//! Timeout policy: bound the duration of one attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{
    ResilienceError, ResilienceResult,
    config::{ConfigResult, ResilienceConfig},
};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for one attempt. Zero fails immediately.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
        }
    }
}

impl ResilienceConfig for TimeoutConfig {
    fn validate(&self) -> ConfigResult<()> {
        // Every duration is valid; zero means "time out now".
        Ok(())
    }
}

/// Bounds how long an attempt may run.
///
/// On expiry the attempt's future is dropped and its cancellation token is
/// cancelled. Work running outside the future (for example on a blocking
/// thread) may keep going; treat it as abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a policy with the given bound.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Create from configuration.
    #[must_use]
    pub const fn from_config(config: TimeoutConfig) -> Self {
        Self::new(config.duration)
    }

    /// The configured bound.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation`, failing with [`ResilienceError::Timeout`] if it does
    /// not finish in time.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), cancelling `cancellation` when the
    /// bound is exceeded so cooperative work can stop.
    #[tracing::instrument(level = "debug", skip_all, fields(
        pattern = "timeout",
        timeout_ms = self.duration.as_millis() as u64,
    ))]
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        operation: F,
        cancellation: &CancellationToken,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        if self.duration.is_zero() {
            debug!("zero timeout, failing without starting the work");
            cancellation.cancel();
            return Err(self.timeout_error());
        }

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                cancellation.cancel();
                debug!("attempt abandoned after timeout");
                Err(self.timeout_error())
            }
        }
    }

    const fn timeout_error(&self) -> ResilienceError {
        ResilienceError::Timeout {
            duration: self.duration,
        }
    }
}

impl From<TimeoutConfig> for TimeoutPolicy {
    fn from(config: TimeoutConfig) -> Self {
        Self::from_config(config)
    }
}
