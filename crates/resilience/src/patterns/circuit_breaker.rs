//! Circuit breaker: fail fast while a dependency is unhealthy.
//!
//! ```text
//!            failure ratio >= threshold
//!   CLOSED ─────────────────────────────▶ OPEN
//!     ▲                                    │ reset_timeout elapsed,
//!     │ success_threshold trial successes  │ next call admitted as trial
//!     │                                    ▼
//!     └──────────────────────────────── HALF_OPEN
//!                 any trial failure ──▶ OPEN
//! ```
//!
//! All transitions happen under one mutex that is never held across an
//! `.await`, so concurrent callers observe a single sequence of states. An
//! atomic mirror of the state serves lock-free introspection.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{
    ErrorPredicate, ResilienceError, ResilienceResult,
    config::{ConfigResult, ResilienceConfig, ensure},
};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Calls pass through and outcomes are recorded.
    Closed,
    /// Calls are rejected without executing.
    Open,
    /// A limited number of trial calls probe for recovery.
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

impl State {
    const fn to_atomic(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in `(0.0, 1.0]` at or above which the breaker opens.
    pub failure_ratio: f64,
    /// Number of most recent outcomes kept in the rolling window.
    pub window_size: usize,
    /// Outcomes required in the window before the ratio is evaluated.
    pub minimum_samples: usize,
    /// Time spent open before a trial call is admitted.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Trial successes in half-open required to close.
    pub success_threshold: usize,
    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_concurrent: usize,
    /// Which failures count against the breaker; others count as successes.
    #[serde(skip)]
    pub failure_on: ErrorPredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.6,
            window_size: 10,
            minimum_samples: 10,
            reset_timeout: Duration::from_secs(5),
            success_threshold: 1,
            half_open_max_concurrent: 1,
            failure_on: ErrorPredicate::always(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure ratio threshold
    #[must_use]
    pub const fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Set the rolling window size
    #[must_use]
    pub const fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Set the minimum number of samples before evaluating
    #[must_use]
    pub const fn with_minimum_samples(mut self, samples: usize) -> Self {
        self.minimum_samples = samples;
        self
    }

    /// Set the open-state duration
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the trial successes required to close
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the concurrent trial limit
    #[must_use]
    pub const fn with_half_open_max_concurrent(mut self, limit: usize) -> Self {
        self.half_open_max_concurrent = limit;
        self
    }

    /// Set the failure classifier
    #[must_use]
    pub fn failure_on(mut self, predicate: ErrorPredicate) -> Self {
        self.failure_on = predicate;
        self
    }
}

impl ResilienceConfig for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(
            self.failure_ratio > 0.0 && self.failure_ratio <= 1.0,
            "failure_ratio must be in (0.0, 1.0]",
        )?;
        ensure(self.window_size > 0, "window_size must be positive")?;
        ensure(
            self.minimum_samples > 0 && self.minimum_samples <= self.window_size,
            "minimum_samples must be in 1..=window_size",
        )?;
        ensure(self.success_threshold > 0, "success_threshold must be positive")?;
        ensure(
            self.half_open_max_concurrent > 0,
            "half_open_max_concurrent must be positive",
        )
    }
}

/// Count-based rolling window of the most recent outcomes.
///
/// No internal lock; callers hold the breaker mutex.
#[derive(Debug)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity,
        }
    }

    fn record(&mut self, was_failure: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(was_failure);
        if was_failure {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.outcomes.len() as f64
        }
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

struct Inner {
    state: State,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
    trial_successes: usize,
    /// Bumped on every transition; outcomes from an older epoch are dropped.
    epoch: u64,
    total_calls: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl Inner {
    fn transition(&mut self, to: State, atomic: &AtomicU8) {
        self.state = to;
        self.epoch += 1;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
        match to {
            State::Open => {
                self.opened_at = Some(Instant::now());
                self.times_opened += 1;
            }
            State::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
            State::HalfOpen => {}
        }
        atomic.store(to.to_atomic(), Ordering::Release);
    }
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    state: AtomicU8,
}

/// Named circuit breaker; cheap to clone, clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Permission to run one call, handed out by [`CircuitBreaker::try_acquire`].
///
/// Report the result with [`record`](Self::record). Dropping the permit
/// without recording (the call was cancelled) frees a trial slot and
/// records nothing.
#[must_use = "the call outcome must be recorded"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    epoch: u64,
    trial: bool,
    done: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("epoch", &self.epoch)
            .field("trial", &self.trial)
            .finish_non_exhaustive()
    }
}

impl CallPermit {
    /// Whether this call is a half-open trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the call's outcome.
    pub fn record<T>(mut self, result: &ResilienceResult<T>) {
        self.done = true;
        match result {
            Ok(_) => self.breaker.on_outcome(self.epoch, self.trial, Some(false)),
            Err(error) if error.is_cancelled() => {
                self.breaker.on_outcome(self.epoch, self.trial, None);
            }
            Err(error) => {
                let failure = self.breaker.shared.config.failure_on.test(error);
                self.breaker.on_outcome(self.epoch, self.trial, Some(failure));
            }
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.on_outcome(self.epoch, self.trial, None);
        }
    }
}

impl CircuitBreaker {
    /// Create a named circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), CircuitBreakerConfig::default())
    }

    fn from_valid(name: String, config: CircuitBreakerConfig) -> Self {
        let inner = Inner {
            state: State::Closed,
            window: OutcomeWindow::new(config.window_size),
            opened_at: None,
            trials_in_flight: 0,
            trial_successes: 0,
            epoch: 0,
            total_calls: 0,
            rejected_calls: 0,
            times_opened: 0,
        };
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                inner: Mutex::new(inner),
                state: AtomicU8::new(State::Closed.to_atomic()),
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state without taking the lock.
    ///
    /// An open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call is admitted as a trial.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_atomic(self.shared.state.load(Ordering::Acquire))
    }

    /// Check if circuit breaker is closed (lock-free)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Check if circuit breaker is open (lock-free)
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Check if circuit breaker is half-open (lock-free)
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.state() == State::HalfOpen
    }

    /// Ask for permission to run one call.
    pub fn try_acquire(&self) -> ResilienceResult<CallPermit> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        let trial = match inner.state {
            State::Closed => false,
            State::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed < shared.config.reset_timeout {
                    inner.rejected_calls += 1;
                    return Err(self.open_error(Some(shared.config.reset_timeout - elapsed)));
                }
                info!(breaker = %shared.name, "circuit breaker transitioning from open to half-open");
                inner.transition(State::HalfOpen, &shared.state);
                inner.trials_in_flight = 1;
                true
            }
            State::HalfOpen => {
                if inner.trials_in_flight >= shared.config.half_open_max_concurrent {
                    inner.rejected_calls += 1;
                    debug!(breaker = %shared.name, "trial limit reached, rejecting");
                    return Err(self.open_error(None));
                }
                inner.trials_in_flight += 1;
                true
            }
        };
        inner.total_calls += 1;
        Ok(CallPermit {
            breaker: self.clone(),
            epoch: inner.epoch,
            trial,
            done: false,
        })
    }

    /// Run `operation` through the breaker.
    #[tracing::instrument(level = "debug", skip_all, fields(
        pattern = "circuit_breaker",
        breaker = %self.shared.name,
        circuit_state = %self.state(),
    ))]
    pub async fn execute<T, F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.record(&result);
        result
    }

    /// `outcome`: `Some(true)` failure, `Some(false)` success, `None` not
    /// counted (cancelled).
    fn on_outcome(&self, epoch: u64, trial: bool, outcome: Option<bool>) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.epoch != epoch {
            debug!(breaker = %shared.name, "discarding outcome from a previous state");
            return;
        }
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        let Some(failure) = outcome else {
            return;
        };

        match inner.state {
            State::Closed => {
                inner.window.record(failure);
                let samples = inner.window.len();
                let ratio = inner.window.failure_ratio();
                if samples >= shared.config.minimum_samples && ratio >= shared.config.failure_ratio
                {
                    warn!(
                        breaker = %shared.name,
                        failure_ratio = ratio,
                        samples,
                        "circuit breaker opening"
                    );
                    inner.transition(State::Open, &shared.state);
                }
            }
            State::HalfOpen if failure => {
                warn!(breaker = %shared.name, "trial failed, circuit breaker reopening");
                inner.transition(State::Open, &shared.state);
            }
            State::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= shared.config.success_threshold {
                    info!(breaker = %shared.name, "circuit breaker transitioning from half-open to closed");
                    inner.transition(State::Closed, &shared.state);
                }
            }
            State::Open => {
                // Same epoch as an open breaker means nothing was admitted.
                warn!(breaker = %shared.name, "unexpected outcome while open");
            }
        }
    }

    fn open_error(&self, retry_after: Option<Duration>) -> ResilienceError {
        ResilienceError::CircuitOpen {
            name: self.shared.name.clone(),
            retry_after,
        }
    }

    /// Force the breaker closed and clear its history.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        info!(breaker = %self.shared.name, "manually resetting circuit breaker");
        inner.transition(State::Closed, &self.shared.state);
    }

    /// Force the breaker open, restarting the reset timer.
    pub fn force_open(&self) {
        let mut inner = self.shared.inner.lock();
        warn!(breaker = %self.shared.name, "circuit breaker forced open");
        inner.transition(State::Open, &self.shared.state);
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.shared.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            window_samples: inner.window.len(),
            failure_ratio: inner.window.failure_ratio(),
            trials_in_flight: inner.trials_in_flight,
            trial_successes: inner.trial_successes,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: State,
    /// Outcomes currently in the rolling window
    pub window_samples: usize,
    /// Failure ratio over the window (0.0 to 1.0)
    pub failure_ratio: f64,
    /// Trial calls currently running
    pub trials_in_flight: usize,
    /// Trial successes in the current half-open period
    pub trial_successes: usize,
    /// Calls admitted
    pub total_calls: u64,
    /// Calls rejected without executing
    pub rejected_calls: u64,
    /// Number of times the breaker has opened
    pub times_opened: u64,
}
