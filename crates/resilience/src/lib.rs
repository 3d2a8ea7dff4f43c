//! # Bulwark Resilience
//!
//! Fault-tolerance policies that wrap a unit of work: retry, circuit breaker,
//! bulkhead, timeout and fallback. Each policy works standalone; a
//! [`PolicyChain`] composes them around one [`Invocation`] in a fixed
//! nesting order and delivers exactly one [`Outcome`].
//!
//! ```no_run
//! use std::time::Duration;
//! use bulwark_resilience::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PolicyRegistry::new();
//! registry.define("inventory", CircuitBreakerConfig::default())?;
//!
//! let chain = PolicyChain::default()
//!     .with(registry.circuit_breaker("inventory")?)
//!     .with(RetryPolicy::new(RetryConfig::exponential(3, Duration::from_millis(100)))?)
//!     .with(TimeoutPolicy::new(Duration::from_secs(2)))
//!     .with(FallbackPolicy::value(0_u32));
//!
//! let outcome = chain
//!     .execute(Invocation::new(|_ctx| async { Ok(42_u32) }))
//!     .await;
//! assert_eq!(outcome.into_result()?, 42);
//! # Ok(())
//! # }
//! ```
//!
//! Stateful policies (breakers and bulkheads) are shared by cloning the
//! handle or by resolving the same name from a [`PolicyRegistry`].

pub mod chain;
pub mod core;
pub mod patterns;
pub mod registry;

pub use crate::chain::{Policy, PolicyChain, execute};
pub use crate::core::{
    AttemptContext, BoxError, ConfigError, ConfigResult, ContextError, ErrorPredicate, Invocation,
    Outcome, PolicyKind, RejectReason, ResilienceConfig, ResilienceError, ResilienceResult,
    ResultExt,
};
pub use crate::patterns::{
    Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats, CallPermit, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerStats, CircuitState, FallbackPolicy, RetryConfig,
    RetryPolicy, TimeoutConfig, TimeoutPolicy,
};
pub use crate::registry::{PolicyConfig, PolicyInstance, PolicyRegistry};

/// Common imports
pub mod prelude {
    pub use crate::{
        AttemptContext, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig,
        CircuitState, ErrorPredicate, FallbackPolicy, Invocation, Outcome, Policy, PolicyChain,
        PolicyRegistry, ResilienceError, ResilienceResult, ResultExt, RetryConfig, RetryPolicy,
        TimeoutPolicy,
    };
}
