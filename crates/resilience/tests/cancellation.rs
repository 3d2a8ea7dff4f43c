//! Cancellation and resource release across the chain.
//!
//! Whatever ends an invocation (caller cancellation, an outer deadline that
//! drops the future, an attempt timeout), bulkhead slots and breaker trial
//! slots must be released exactly once and pending retry timers abandoned.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use bulwark_resilience::prelude::*;
use bulwark_resilience::BulkheadConfig;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Caller cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelling_during_retry_delay_stops_further_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let token = CancellationToken::new();

    let counter = Arc::clone(&attempts);
    let invocation = Invocation::<()>::new(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(ResilienceError::message("flaky")) }
    })
    .with_cancellation(token.clone());

    let chain = PolicyChain::default().with(
        RetryPolicy::new(RetryConfig::fixed(10, Duration::from_secs(60))).unwrap(),
    );
    let handle = tokio::spawn(async move { chain.execute(invocation).await });

    wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
    token.cancel();

    let outcome = handle.await.unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn caller_cancellation_reaches_the_attempt_token() {
    let token = CancellationToken::new();
    let seen = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&seen);
    let invocation = Invocation::new(move |ctx: AttemptContext| {
        *slot.lock().unwrap() = Some(ctx.cancellation().clone());
        async {
            std::future::pending::<()>().await;
            Ok(())
        }
    })
    .with_cancellation(token.clone());

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        canceller.cancel();
    });

    let outcome = PolicyChain::default()
        .with(TimeoutPolicy::new(Duration::from_secs(60)))
        .execute(invocation)
        .await;

    assert!(outcome.is_cancelled());
    let attempt_token = seen.lock().unwrap().take().unwrap();
    assert!(attempt_token.is_cancelled());
}

// ---------------------------------------------------------------------------
// Slot release
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn outer_deadline_releases_bulkhead_slot() {
    let bulkhead = Bulkhead::new("db", BulkheadConfig::unqueued(1)).unwrap();
    let chain = PolicyChain::<()>::default().with(bulkhead.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        chain.execute(Invocation::new(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(bulkhead.stats().active, 0);
    assert!(
        chain
            .execute(Invocation::new(|_ctx| async { Ok(()) }))
            .await
            .is_success()
    );
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_inside_bulkhead_releases_slot() {
    let bulkhead = Bulkhead::new("db", BulkheadConfig::unqueued(1)).unwrap();
    let chain = PolicyChain::<()>::default()
        .with(bulkhead.clone())
        .with(TimeoutPolicy::new(Duration::from_millis(50)));

    let outcome = chain
        .execute(Invocation::new(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }))
        .await;

    assert!(outcome.error().is_some_and(ResilienceError::is_timeout));
    assert_eq!(bulkhead.stats().active, 0);
}

#[tokio::test]
async fn queued_caller_cancelled_leaves_queue() {
    let bulkhead = Bulkhead::new("db", BulkheadConfig::unqueued(1).with_queue_length(1)).unwrap();
    let held = bulkhead.acquire().await.unwrap();

    let token = CancellationToken::new();
    let chain = PolicyChain::<()>::default().with(bulkhead.clone());
    let invocation = Invocation::new(|_ctx| async { Ok(()) }).with_cancellation(token.clone());
    let handle = tokio::spawn(async move { chain.execute(invocation).await });

    wait_until(|| bulkhead.stats().waiting == 1).await;
    token.cancel();

    assert!(handle.await.unwrap().is_cancelled());
    assert_eq!(bulkhead.stats().waiting, 0);

    drop(held);
    assert_eq!(bulkhead.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_trial_frees_the_probe_slot() {
    let breaker = CircuitBreaker::new(
        "svc",
        CircuitBreakerConfig::default().with_reset_timeout(Duration::from_secs(1)),
    )
    .unwrap();
    breaker.force_open();
    tokio::time::advance(Duration::from_secs(2)).await;

    let chain = PolicyChain::<()>::default().with(breaker.clone());
    let token = CancellationToken::new();
    let invocation = Invocation::new(|_ctx| async {
        std::future::pending::<()>().await;
        Ok(())
    })
    .with_cancellation(token.clone());

    let probe = tokio::spawn({
        let chain = chain.clone();
        async move { chain.execute(invocation).await }
    });
    wait_until(|| breaker.stats().trials_in_flight == 1).await;
    token.cancel();
    assert!(probe.await.unwrap().is_cancelled());

    // Nothing was recorded, so the breaker is still half-open and can probe.
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(breaker.stats().trials_in_flight, 0);
    assert!(
        chain
            .execute(Invocation::new(|_ctx| async { Ok(()) }))
            .await
            .is_success()
    );
    assert_eq!(breaker.state(), CircuitState::Closed);
}
