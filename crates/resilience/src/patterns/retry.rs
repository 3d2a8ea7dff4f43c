//! Retry policy with exponential backoff, jitter and an overall deadline.
//!
//! The delay before retry `n` (0-based) is
//! `min(base_delay * multiplier^n, max_delay) * j` where `j` is drawn
//! uniformly from `[1 - jitter, 1 + jitter]`. With a `seed` configured every
//! execution draws the same sequence, which makes schedules reproducible in
//! tests.
//!
//! The deadline is the last gate: a retry is only scheduled when the
//! computed delay still ends before `start + overall_timeout`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{
    ErrorPredicate, ResilienceError, ResilienceResult,
    config::{ConfigResult, ResilienceConfig, ensure},
};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Cap applied before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Relative jitter in `[0.0, 1.0)`; `0.2` means ±20%.
    pub jitter: f64,
    /// Deadline for the whole retry sequence, measured from the first attempt.
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Option<Duration>,
    /// Fixed RNG seed for reproducible jitter.
    pub seed: Option<u64>,
    /// Which failures are retryable. Supplied by the configuration layer.
    #[serde(skip)]
    pub retry_on: ErrorPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            overall_timeout: None,
            seed: None,
            retry_on: ErrorPredicate::always(),
        }
    }
}

impl RetryConfig {
    /// Fixed delay between attempts, no jitter.
    #[must_use]
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Exponential backoff doubling from `base_delay`.
    #[must_use]
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Set the retry count
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the delay cap
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter fraction
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the overall deadline
    #[must_use]
    pub const fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    /// Fix the RNG seed
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the retryable-error classifier
    #[must_use]
    pub fn retry_on(mut self, predicate: ErrorPredicate) -> Self {
        self.retry_on = predicate;
        self
    }

    /// Un-jittered delay before retry `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        // Near `Duration::MAX` the f64 round trip overshoots; saturate at the cap.
        Duration::try_from_secs_f64(capped).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn jittered(&self, retry: u32, rng: &mut fastrand::Rng) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = (1.0 - self.jitter) + rng.f64() * 2.0 * self.jitter;
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    fn rng(&self) -> fastrand::Rng {
        self.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed)
    }
}

impl ResilienceConfig for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(
            self.multiplier.is_finite() && self.multiplier >= 1.0,
            "multiplier must be a finite number >= 1.0",
        )?;
        ensure(
            self.jitter.is_finite() && (0.0..1.0).contains(&self.jitter),
            "jitter must be in [0.0, 1.0)",
        )?;
        ensure(
            self.max_delay >= self.base_delay,
            "max_delay must not be smaller than base_delay",
        )
    }
}

/// Re-executes failed work according to a [`RetryConfig`].
///
/// Retries are transparent: a success on any attempt is returned as-is.
/// Non-retryable failures and cancellation propagate unchanged after the
/// attempt that produced them. Running out of retries or hitting the
/// deadline yields [`ResilienceError::RetriesExhausted`] wrapping the last
/// failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a validated retry policy
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The jittered delay schedule, one entry per retry.
    ///
    /// Deterministic when a seed is configured and identical to what
    /// [`execute`](Self::execute) will sleep.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut rng = self.config.rng();
        (0..self.config.max_retries).map(move |retry| self.config.jittered(retry, &mut rng))
    }

    /// Run `operation` until it succeeds or retrying stops.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); a cancelled token interrupts the
    /// inter-attempt delay and stops further attempts.
    #[tracing::instrument(level = "debug", skip_all, fields(
        pattern = "retry",
        max_retries = self.config.max_retries,
        attempts = tracing::field::Empty,
    ))]
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        mut operation: F,
        cancellation: &CancellationToken,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let started = Instant::now();
        let deadline = self
            .config
            .overall_timeout
            .and_then(|t| started.checked_add(t));
        let mut rng = self.config.rng();
        let mut attempts = 0u32;

        loop {
            if cancellation.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            attempts += 1;
            tracing::Span::current().record("attempts", attempts);

            let error = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancelled() || !self.config.retry_on.test(&error) {
                debug!(attempts, %error, "failure is not retryable");
                return Err(error);
            }

            let retry = attempts - 1;
            if retry >= self.config.max_retries {
                warn!(attempts, %error, "retries exhausted");
                return Err(exhausted(attempts, error));
            }

            let delay = self.config.jittered(retry, &mut rng);
            if let Some(deadline) = deadline {
                let wake = Instant::now().checked_add(delay);
                if wake.is_none_or(|wake| wake >= deadline) {
                    warn!(attempts, ?delay, "retry deadline reached");
                    return Err(exhausted(attempts, error));
                }
            }

            debug!(attempts, ?delay, %error, "scheduling retry");
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return Err(ResilienceError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn exhausted(attempts: u32, last: ResilienceError) -> ResilienceError {
    ResilienceError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}
