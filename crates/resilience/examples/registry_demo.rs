//! Policy Registry Demonstration
//!
//! Policies are defined once from JSON, resolved by name at each call site
//! and reported for health checks.

use std::sync::Arc;
use std::time::Duration;

use bulwark_resilience::ConfigError;
use bulwark_resilience::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bulwark_log::init(bulwark_log::Config::from_env())?;

    let registry = Arc::new(PolicyRegistry::new());
    let loaded = registry.load_json(&json!({
        "inventory-bulkhead": { "kind": "bulkhead", "max_concurrent": 3, "queue_length": 0 },
        "inventory-breaker": { "kind": "circuit_breaker", "reset_timeout": "2s" },
        "inventory-retry": { "kind": "retry", "max_retries": 2, "base_delay": "20ms" },
        "inventory-timeout": { "kind": "timeout", "duration": "100ms" },
    }))?;
    registry.register_fallback("inventory-empty", FallbackPolicy::value(0_u32))?;
    println!("loaded {loaded} policies: {:?}", registry.names());

    let names = [
        "inventory-bulkhead",
        "inventory-breaker",
        "inventory-retry",
        "inventory-timeout",
        "inventory-empty",
    ];

    let mut handles = Vec::new();
    for sku in 0..8_u32 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            let chain = registry.chain::<u32>(&names)?;
            let outcome = chain
                .execute(Invocation::new(move |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(sku * 10)
                }))
                .await;
            Ok::<_, ConfigError>((sku, outcome))
        }));
    }

    for handle in handles {
        let (sku, outcome) = handle.await??;
        match outcome.into_result() {
            Ok(stock) => println!("  sku {sku}: {stock} in stock"),
            Err(e) => println!("  sku {sku}: {e}"),
        }
    }

    println!("\nbreakers: {:?}", registry.breaker_states());
    println!("bulkheads: {:#?}", registry.bulkhead_stats());
    Ok(())
}
