//! Retry and Circuit Breaker Demonstration
//!
//! A flaky dependency recovers after a few retries; a dead one exhausts
//! retries, trips the breaker and is answered by a fallback until the
//! breaker probes again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bulwark_resilience::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bulwark_log::auto_init()?;

    println!("Retry and Circuit Breaker Demo");
    println!("==============================");

    let retry = RetryPolicy::new(
        RetryConfig::exponential(3, Duration::from_millis(50)).with_seed(7),
    )?;
    println!("\nretry schedule: {:?}", retry.delays().collect::<Vec<_>>());

    // Fails twice, then succeeds.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let flaky = Invocation::new(move |ctx: AttemptContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if ctx.attempt() < 3 {
                Err(ResilienceError::message("connection reset"))
            } else {
                Ok("price: 42")
            }
        }
    });
    let outcome = PolicyChain::default().with(retry.clone()).execute(flaky).await;
    println!(
        "flaky dependency: {:?} after {} calls",
        outcome.into_result()?,
        calls.load(Ordering::SeqCst)
    );

    let breaker = CircuitBreaker::new(
        "pricing",
        CircuitBreakerConfig::default()
            .with_window_size(4)
            .with_minimum_samples(2)
            .with_reset_timeout(Duration::from_millis(500)),
    )?;
    let chain = PolicyChain::default()
        .with(breaker.clone())
        .with(retry)
        .with(FallbackPolicy::new(|error: &ResilienceError| {
            let reason = error.to_string();
            async move { Ok(format!("cached price ({reason})")) }
        }));

    println!();
    for round in 1..=4 {
        let dead = Invocation::new(|_ctx| async {
            Err::<String, _>(ResilienceError::message("service unavailable"))
        });
        let answer = chain.execute(dead).await.into_result()?;
        println!("round {round}: breaker {} -> {answer}", breaker.state());
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let healthy = Invocation::new(|_ctx| async { Ok("price: 40".to_string()) });
    let answer = chain.execute(healthy).await.into_result()?;
    println!("after reset timeout: breaker {} -> {answer}", breaker.state());

    println!("\n{:#?}", breaker.stats());
    Ok(())
}
