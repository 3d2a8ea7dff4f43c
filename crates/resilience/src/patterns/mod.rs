//! The five policies. Each works standalone through its own `execute`, and
//! composes through [`PolicyChain`](crate::PolicyChain).

pub mod bulkhead;
pub mod circuit_breaker;
pub mod fallback;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, State as CircuitState,
};
pub use fallback::FallbackPolicy;
pub use retry::{RetryConfig, RetryPolicy};
pub use timeout::{TimeoutConfig, TimeoutPolicy};
