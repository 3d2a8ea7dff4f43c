//! Error taxonomy shared by every policy.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed underlying failure produced by a unit of work.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The policy layer that produced or last reclassified a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Concurrency limiting.
    Bulkhead,
    /// Substitute result on final failure.
    Fallback,
    /// Fail-fast state machine.
    CircuitBreaker,
    /// Re-execution with backoff.
    Retry,
    /// Per-attempt duration bound.
    Timeout,
}

impl PolicyKind {
    /// Position in the chain, outermost first.
    #[must_use]
    pub const fn nesting_rank(self) -> u8 {
        match self {
            Self::Bulkhead => 0,
            Self::Fallback => 1,
            Self::CircuitBreaker => 2,
            Self::Retry => 3,
            Self::Timeout => 4,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulkhead => write!(f, "bulkhead"),
            Self::Fallback => write!(f, "fallback"),
            Self::CircuitBreaker => write!(f, "circuit_breaker"),
            Self::Retry => write!(f, "retry"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why a bulkhead refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Every slot was taken and the wait queue was full or disabled.
    QueueFull,
    /// The call waited in the queue longer than the queue timeout.
    QueueTimeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueTimeout => write!(f, "queue wait timed out"),
        }
    }
}

/// Failure reported by a policy chain.
///
/// Every variant other than [`Operation`](Self::Operation) and
/// [`Cancelled`](Self::Cancelled) names the policy that raised it, see
/// [`policy_kind`](Self::policy_kind).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResilienceError {
    /// An attempt did not finish within its time bound.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// The bound that was exceeded.
        duration: Duration,
    },

    /// The circuit breaker refused the call without executing it.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name.
        name: String,
        /// Time left until a trial call will be admitted, when known.
        retry_after: Option<Duration>,
    },

    /// The bulkhead refused admission.
    #[error("bulkhead '{name}' rejected the call: {reason}")]
    BulkheadRejected {
        /// Bulkhead name.
        name: String,
        /// Rejection cause.
        reason: RejectReason,
    },

    /// Retrying stopped without a success.
    #[error("retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Attempts executed, including the first one.
        attempts: u32,
        /// Failure of the last attempt.
        #[source]
        last: Box<ResilienceError>,
    },

    /// The fallback ran and failed too.
    #[error("fallback failed after primary failure: {primary}")]
    FallbackFailed {
        /// The failure that triggered the fallback.
        primary: Box<ResilienceError>,
        /// The fallback's own failure.
        #[source]
        source: Box<ResilienceError>,
    },

    /// The invocation was cancelled by its caller.
    #[error("invocation cancelled")]
    Cancelled,

    /// Failure of the unit of work itself, passed through unchanged.
    #[error("{source}")]
    Operation {
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl ResilienceError {
    /// Wrap an underlying failure of the unit of work.
    pub fn operation(error: impl Into<BoxError>) -> Self {
        Self::Operation {
            source: error.into(),
        }
    }

    /// Wrap a plain message as an operation failure.
    pub fn message(message: impl Into<String>) -> Self {
        Self::operation(message.into())
    }

    /// Policy layer that last touched this failure, `None` for passthrough
    /// operation errors and cancellation.
    #[must_use]
    pub const fn policy_kind(&self) -> Option<PolicyKind> {
        match self {
            Self::Timeout { .. } => Some(PolicyKind::Timeout),
            Self::CircuitOpen { .. } => Some(PolicyKind::CircuitBreaker),
            Self::BulkheadRejected { .. } => Some(PolicyKind::Bulkhead),
            Self::RetriesExhausted { .. } => Some(PolicyKind::Retry),
            Self::FallbackFailed { .. } => Some(PolicyKind::Fallback),
            Self::Cancelled | Self::Operation { .. } => None,
        }
    }

    /// Whether the caller cancelled the invocation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Innermost failure, following `RetriesExhausted::last` and
    /// `FallbackFailed::source`.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetriesExhausted { last, .. } => last.root_cause(),
            Self::FallbackFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Underlying operation error of the innermost failure, if any.
    #[must_use]
    pub fn operation_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self.root_cause() {
            Self::Operation { source } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Downcast the underlying operation error to a concrete type.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.operation_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Classifies failures; supplied by the configuration layer.
///
/// Used as "is this retryable", "does this count as a breaker failure" and
/// "does the fallback apply". Predicates are computed once at configuration
/// time, not looked up per call.
#[derive(Clone)]
pub struct ErrorPredicate(Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>);

impl ErrorPredicate {
    /// Build a predicate from a closure.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Matches every failure.
    #[must_use]
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// Matches nothing.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Matches failures whose underlying operation error is an `E`.
    #[must_use]
    pub fn on_error_type<E: StdError + 'static>() -> Self {
        Self::new(|error| error.downcast_ref::<E>().is_some())
    }

    /// Inverts the predicate.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::new(move |error| !(self.0)(error))
    }

    /// Evaluate the predicate.
    #[must_use]
    pub fn test(&self, error: &ResilienceError) -> bool {
        (self.0)(error)
    }
}

impl Default for ErrorPredicate {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Debug for ErrorPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPredicate(<fn>)")
    }
}
