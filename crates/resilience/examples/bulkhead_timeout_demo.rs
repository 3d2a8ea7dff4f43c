//! Bulkhead and Timeout Pattern Demonstration
//!
//! Five concurrent calls share a bulkhead of two slots with a short queue.
//! Each attempt is bounded by a timeout; slow calls are abandoned and their
//! slots handed to the next waiter.

use std::time::{Duration, Instant};

use bulwark_resilience::BulkheadConfig;
use bulwark_resilience::prelude::*;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bulwark_log::init(bulwark_log::Config::development())?;

    println!("Bulkhead and Timeout Pattern Demo");
    println!("=================================");

    let bulkhead = Bulkhead::new(
        "reports",
        BulkheadConfig::unqueued(2)
            .with_queue_length(2)
            .with_queue_timeout(Duration::from_millis(400)),
    )?;
    let chain = PolicyChain::default()
        .with(bulkhead.clone())
        .with(TimeoutPolicy::new(Duration::from_millis(250)));

    let mut handles = Vec::new();
    for i in 1..=5_u64 {
        let chain = chain.clone();
        handles.push(tokio::spawn(async move {
            let start = Instant::now();
            let outcome = chain
                .execute(Invocation::new(move |_ctx| async move {
                    // Every third report is slow.
                    let work = if i % 3 == 0 { 600 } else { 150 };
                    sleep(Duration::from_millis(work)).await;
                    Ok(format!("report {i}"))
                }))
                .await;
            (i, start.elapsed(), outcome)
        }));
    }

    for handle in handles {
        let (i, elapsed, outcome) = handle.await?;
        match outcome.into_result() {
            Ok(report) => println!("  call {i}: {report} in {elapsed:?}"),
            Err(e) => println!("  call {i}: failed after {elapsed:?}: {e}"),
        }
    }

    let stats = bulkhead.stats();
    println!(
        "\nadmitted {} / rejected {} / active {}",
        stats.admitted_total, stats.rejected_total, stats.active
    );
    Ok(())
}
