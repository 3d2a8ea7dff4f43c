//! Benchmarks for policy chains
//!
//! Measures:
//! - Overhead of each single layer around an immediately successful call
//! - Overhead of the full five-layer chain
//! - Breaker fast-fail path while open

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

use bulwark_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, FallbackPolicy, Invocation, Policy, PolicyChain,
    RetryPolicy, TimeoutPolicy,
};

fn single_layers() -> Vec<(&'static str, Policy<u64>)> {
    vec![
        (
            "bulkhead",
            Bulkhead::new("bench", BulkheadConfig::default()).unwrap().into(),
        ),
        ("circuit_breaker", CircuitBreaker::with_defaults("bench").into()),
        ("retry", RetryPolicy::with_defaults().into()),
        ("timeout", TimeoutPolicy::new(Duration::from_secs(1)).into()),
        ("fallback", FallbackPolicy::value(0).into()),
    ]
}

fn chain_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("chain/success");

    group.bench_function("direct", |b| {
        let chain = PolicyChain::<u64>::default();
        b.to_async(&rt).iter(|| {
            let chain = chain.clone();
            async move { black_box(chain.execute(Invocation::new(|_| async { Ok(1) })).await) }
        });
    });

    for (name, layer) in single_layers() {
        group.bench_with_input(BenchmarkId::new("single", name), &layer, |b, layer| {
            let chain = PolicyChain::new([layer.clone()]);
            b.to_async(&rt).iter(|| {
                let chain = chain.clone();
                async move { black_box(chain.execute(Invocation::new(|_| async { Ok(1) })).await) }
            });
        });
    }

    group.bench_function("all_layers", |b| {
        let chain = PolicyChain::new(single_layers().into_iter().map(|(_, layer)| layer));
        b.to_async(&rt).iter(|| {
            let chain = chain.clone();
            async move { black_box(chain.execute(Invocation::new(|_| async { Ok(1) })).await) }
        });
    });

    group.finish();
}

fn open_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::with_defaults("bench-open");
    breaker.force_open();
    let chain = PolicyChain::<u64>::default().with(breaker);

    c.bench_function("chain/open_breaker_rejects", |b| {
        b.to_async(&rt).iter(|| {
            let chain = chain.clone();
            async move { black_box(chain.execute(Invocation::new(|_| async { Ok(1) })).await) }
        });
    });
}

criterion_group!(benches, chain_overhead, open_breaker);
criterion_main!(benches);
