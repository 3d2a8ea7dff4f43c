//! Composition of policies around one invocation.
//!
//! Layers nest in a fixed order, outermost first:
//!
//! ```text
//! Bulkhead -> Fallback -> CircuitBreaker -> Retry -> Timeout -> unit of work
//! ```
//!
//! The bulkhead rejects overload before anything else runs. The fallback sees
//! the final failure, including `CircuitOpen` and `RetriesExhausted`. The
//! breaker records one outcome per logical call, not one per attempt, and
//! every attempt is bounded by its own timeout.

use std::fmt;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Invocation, Outcome, PolicyKind, ResilienceError, ResilienceResult};
use crate::patterns::{Bulkhead, CircuitBreaker, FallbackPolicy, RetryPolicy, TimeoutPolicy};

/// One layer of a [`PolicyChain`].
pub enum Policy<T> {
    /// Concurrency limit
    Bulkhead(Bulkhead),
    /// Substitute on final failure
    Fallback(FallbackPolicy<T>),
    /// Fail fast on sustained failure
    CircuitBreaker(CircuitBreaker),
    /// Re-execute failed attempts
    Retry(RetryPolicy),
    /// Bound each attempt
    Timeout(TimeoutPolicy),
}

impl<T> Policy<T> {
    /// Which kind of layer this is.
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match self {
            Self::Bulkhead(_) => PolicyKind::Bulkhead,
            Self::Fallback(_) => PolicyKind::Fallback,
            Self::CircuitBreaker(_) => PolicyKind::CircuitBreaker,
            Self::Retry(_) => PolicyKind::Retry,
            Self::Timeout(_) => PolicyKind::Timeout,
        }
    }
}

impl<T> Clone for Policy<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bulkhead(b) => Self::Bulkhead(b.clone()),
            Self::Fallback(f) => Self::Fallback(f.clone()),
            Self::CircuitBreaker(cb) => Self::CircuitBreaker(cb.clone()),
            Self::Retry(r) => Self::Retry(r.clone()),
            Self::Timeout(t) => Self::Timeout(*t),
        }
    }
}

impl<T> fmt::Debug for Policy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulkhead(b) => f.debug_tuple("Bulkhead").field(b).finish(),
            Self::Fallback(fb) => f.debug_tuple("Fallback").field(fb).finish(),
            Self::CircuitBreaker(cb) => f.debug_tuple("CircuitBreaker").field(cb).finish(),
            Self::Retry(r) => f.debug_tuple("Retry").field(r).finish(),
            Self::Timeout(t) => f.debug_tuple("Timeout").field(t).finish(),
        }
    }
}

impl<T> From<Bulkhead> for Policy<T> {
    fn from(bulkhead: Bulkhead) -> Self {
        Self::Bulkhead(bulkhead)
    }
}

impl<T> From<FallbackPolicy<T>> for Policy<T> {
    fn from(fallback: FallbackPolicy<T>) -> Self {
        Self::Fallback(fallback)
    }
}

impl<T> From<CircuitBreaker> for Policy<T> {
    fn from(breaker: CircuitBreaker) -> Self {
        Self::CircuitBreaker(breaker)
    }
}

impl<T> From<RetryPolicy> for Policy<T> {
    fn from(retry: RetryPolicy) -> Self {
        Self::Retry(retry)
    }
}

impl<T> From<TimeoutPolicy> for Policy<T> {
    fn from(timeout: TimeoutPolicy) -> Self {
        Self::Timeout(timeout)
    }
}

/// Ordered, immutable set of layers.
///
/// Policies may be supplied in any order; the chain sorts them into the
/// nesting order. A later policy of the same kind replaces an earlier one.
pub struct PolicyChain<T> {
    layers: Vec<Policy<T>>,
}

impl<T> Clone for PolicyChain<T> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
        }
    }
}

impl<T> fmt::Debug for PolicyChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyChain")
            .field("layers", &self.layers)
            .finish()
    }
}

impl<T> Default for PolicyChain<T> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<T: Send + 'static> PolicyChain<T> {
    /// Build a chain from policies in any order.
    pub fn new<I>(policies: I) -> Self
    where
        I: IntoIterator<Item = Policy<T>>,
    {
        policies.into_iter().fold(Self::default(), Self::with)
    }

    /// Add a layer, replacing any existing layer of the same kind.
    #[must_use]
    pub fn with(mut self, policy: impl Into<Policy<T>>) -> Self {
        let policy = policy.into();
        let kind = policy.kind();
        if let Some(slot) = self.layers.iter_mut().find(|layer| layer.kind() == kind) {
            *slot = policy;
        } else {
            self.layers.push(policy);
            self.layers.sort_by_key(|layer| layer.kind().nesting_rank());
        }
        self
    }

    /// Layer kinds, outermost first.
    pub fn layers(&self) -> impl Iterator<Item = PolicyKind> + '_ {
        self.layers.iter().map(Policy::kind)
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no layers (work runs directly).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `invocation` through every layer and deliver its single outcome.
    ///
    /// Cancelling the invocation's token stops the chain at whatever layer
    /// it is in; held bulkhead slots and breaker trial slots are released
    /// and the outcome is [`Outcome::Cancelled`].
    #[tracing::instrument(level = "debug", skip_all, fields(layers = self.layers.len()))]
    pub async fn execute(&self, mut invocation: Invocation<T>) -> Outcome<T> {
        let token = invocation.cancellation().clone();
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }
        invocation.mark_started();

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(ResilienceError::Cancelled),
            result = run(&self.layers, &invocation, token.clone()) => result,
        };

        debug!(
            attempts = invocation.attempts(),
            elapsed_ms = invocation.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "invocation finished"
        );
        Outcome::from(result)
    }
}

/// Run `invocation` through `policies`, see [`PolicyChain::execute`].
pub async fn execute<T, I>(invocation: Invocation<T>, policies: I) -> Outcome<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Policy<T>>,
{
    PolicyChain::new(policies).execute(invocation).await
}

fn run<'a, T: Send + 'static>(
    layers: &'a [Policy<T>],
    invocation: &'a Invocation<T>,
    token: CancellationToken,
) -> BoxFuture<'a, ResilienceResult<T>> {
    let Some((layer, inner)) = layers.split_first() else {
        return invocation.attempt(token);
    };

    match layer {
        Policy::Bulkhead(bulkhead) => {
            Box::pin(bulkhead.execute(move || run(inner, invocation, token)))
        }
        Policy::Fallback(fallback) => {
            Box::pin(fallback.execute(move || run(inner, invocation, token)))
        }
        Policy::CircuitBreaker(breaker) => {
            Box::pin(breaker.execute(move || run(inner, invocation, token)))
        }
        Policy::Retry(retry) => Box::pin(async move {
            retry
                .execute_with_cancellation(|| run(inner, invocation, token.clone()), &token)
                .await
        }),
        Policy::Timeout(timeout) => Box::pin(async move {
            // Cancelled on expiry without touching the caller's token.
            let attempt = token.child_token();
            timeout
                .execute_with_cancellation(|| run(inner, invocation, attempt.clone()), &attempt)
                .await
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttemptContext;
    use crate::patterns::{BulkheadConfig, CircuitBreakerConfig, RetryConfig};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig::fixed(max_retries, Duration::from_millis(10))).unwrap()
    }

    #[test]
    fn layers_are_sorted_into_nesting_order() {
        let chain = PolicyChain::<()>::new([
            Policy::from(TimeoutPolicy::new(Duration::from_secs(1))),
            Policy::from(retry(2)),
            Policy::from(FallbackPolicy::value(())),
            Policy::from(Bulkhead::new("b", BulkheadConfig::default()).unwrap()),
            Policy::from(CircuitBreaker::with_defaults("cb")),
        ]);

        assert_eq!(
            chain.layers().collect::<Vec<_>>(),
            vec![
                PolicyKind::Bulkhead,
                PolicyKind::Fallback,
                PolicyKind::CircuitBreaker,
                PolicyKind::Retry,
                PolicyKind::Timeout,
            ]
        );
    }

    #[test]
    fn later_policy_of_same_kind_replaces_earlier() {
        let chain = PolicyChain::<()>::default()
            .with(TimeoutPolicy::new(Duration::from_secs(1)))
            .with(TimeoutPolicy::new(Duration::from_secs(2)));

        assert_eq!(chain.len(), 1);
        match &chain.layers[0] {
            Policy::Timeout(t) => assert_eq!(t.duration(), Duration::from_secs(2)),
            other => panic!("unexpected layer: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_runs_work_directly() {
        let chain = PolicyChain::default();
        assert!(chain.is_empty());
        let outcome = chain.execute(Invocation::new(|_| async { Ok(7) })).await;
        assert_eq!(outcome.into_result().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_each_attempt_not_the_sequence() {
        // First two attempts hang past the bound, the third is fast.
        let invocation = Invocation::new(|ctx: AttemptContext| async move {
            if ctx.attempt() < 3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(ctx.attempt())
        });

        let chain = PolicyChain::default()
            .with(retry(2))
            .with(TimeoutPolicy::new(Duration::from_millis(50)));

        assert_eq!(chain.execute(invocation).await.into_result().unwrap(), 3);
    }

    #[tokio::test]
    async fn fallback_sees_circuit_open() {
        let breaker = CircuitBreaker::new("cb", CircuitBreakerConfig::default()).unwrap();
        breaker.force_open();

        let chain = PolicyChain::default()
            .with(breaker)
            .with(FallbackPolicy::new(|error: &ResilienceError| {
                let open = matches!(error, ResilienceError::CircuitOpen { .. });
                async move { Ok(open) }
            }));

        let outcome = chain.execute(Invocation::new(|_| async { Ok(false) })).await;
        assert!(outcome.into_result().unwrap());
    }

    #[tokio::test]
    async fn caller_cancellation_releases_bulkhead_slot() {
        let bulkhead = Bulkhead::new("b", BulkheadConfig::unqueued(1)).unwrap();
        let token = CancellationToken::new();
        let invocation = Invocation::new(|ctx: AttemptContext| async move {
            ctx.cancellation().cancelled().await;
            Ok::<_, ResilienceError>(())
        })
        .with_cancellation(token.clone());

        let chain = PolicyChain::default().with(bulkhead.clone());
        let handle = tokio::spawn(async move { chain.execute(invocation).await });

        while bulkhead.stats().active == 0 {
            tokio::task::yield_now().await;
        }
        token.cancel();

        assert!(handle.await.unwrap().is_cancelled());
        assert_eq!(bulkhead.stats().active, 0);
    }

    #[tokio::test]
    async fn pre_cancelled_invocation_never_runs() {
        let token = CancellationToken::new();
        token.cancel();
        let invocation = Invocation::new(|_| async { Ok(()) }).with_cancellation(token);

        let outcome = execute(invocation, [Policy::from(retry(3))]).await;
        assert!(outcome.is_cancelled());
    }
}
