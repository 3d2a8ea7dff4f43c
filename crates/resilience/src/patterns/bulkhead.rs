//! Bulkhead: cap concurrent in-flight calls.
//!
//! Admission goes through a fair `tokio` semaphore, so waiters are served in
//! arrival order. Permits are RAII guards: a slot is released exactly once
//! however the call ends, including when an outer layer drops the future.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::core::{
    RejectReason, ResilienceError, ResilienceResult,
    config::{ConfigResult, ResilienceConfig, ensure},
};

/// Bulkhead configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Calls allowed to run at once.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; zero rejects immediately when full.
    pub queue_length: usize,
    /// Longest a queued caller waits; `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_length: 10,
            queue_timeout: None,
        }
    }
}

impl BulkheadConfig {
    /// Limit with no wait queue.
    #[must_use]
    pub const fn unqueued(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            queue_length: 0,
            queue_timeout: None,
        }
    }

    /// Set the concurrency limit
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the queue length
    #[must_use]
    pub const fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Set the queue wait bound
    #[must_use]
    pub const fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }
}

impl ResilienceConfig for BulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure(self.max_concurrent > 0, "max_concurrent must be positive")?;
        ensure(
            self.max_concurrent <= Semaphore::MAX_PERMITS,
            "max_concurrent exceeds the semaphore limit",
        )
    }
}

struct Shared {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Named bulkhead; cheap to clone, clones share slots.
#[derive(Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// An admitted slot; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the waiting count however the wait ends.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Create a named bulkhead
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                waiting: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        })
    }

    /// Bulkhead name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &BulkheadConfig {
        &self.shared.config
    }

    /// Acquire a slot, queueing if configured.
    pub async fn acquire(&self) -> ResilienceResult<BulkheadPermit> {
        let shared = &self.shared;

        if let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() {
            return Ok(self.admit(permit));
        }

        let reserved = shared
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < shared.config.queue_length).then_some(waiting + 1)
            });
        if reserved.is_err() {
            return Err(self.reject(RejectReason::QueueFull));
        }
        let _slot = QueueSlot(&shared.waiting);
        debug!(bulkhead = %shared.name, "at capacity, queueing");

        let wait = Arc::clone(&shared.semaphore).acquire_owned();
        let acquired = match shared.config.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(acquired) => acquired,
                Err(_elapsed) => return Err(self.reject(RejectReason::QueueTimeout)),
            },
            None => wait.await,
        };

        // The semaphore is owned here and never closed.
        acquired
            .map(|permit| self.admit(permit))
            .map_err(|_closed| self.reject(RejectReason::QueueFull))
    }

    /// Run `operation` inside a slot.
    #[tracing::instrument(level = "debug", skip_all, fields(
        pattern = "bulkhead",
        bulkhead = %self.shared.name,
        max_concurrent = self.shared.config.max_concurrent,
    ))]
    pub async fn execute<T, F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let _permit = self.acquire().await?;
        operation().await
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.shared.admitted.fetch_add(1, Ordering::Relaxed);
        BulkheadPermit { _permit: permit }
    }

    fn reject(&self, reason: RejectReason) -> ResilienceError {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(bulkhead = %self.shared.name, %reason, "bulkhead rejected call");
        ResilienceError::BulkheadRejected {
            name: self.shared.name.clone(),
            reason,
        }
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        let shared = &self.shared;
        let available = shared.semaphore.available_permits();
        BulkheadStats {
            max_concurrent: shared.config.max_concurrent,
            active: shared.config.max_concurrent.saturating_sub(available),
            waiting: shared.waiting.load(Ordering::Acquire),
            queue_length: shared.config.queue_length,
            admitted_total: shared.admitted.load(Ordering::Relaxed),
            rejected_total: shared.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Bulkhead statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    /// Concurrency limit
    pub max_concurrent: usize,
    /// Calls currently holding a slot
    pub active: usize,
    /// Callers currently queued
    pub waiting: usize,
    /// Queue capacity
    pub queue_length: usize,
    /// Calls admitted since creation
    pub admitted_total: u64,
    /// Calls rejected since creation
    pub rejected_total: u64,
}

impl BulkheadStats {
    /// Whether every slot is taken.
    #[must_use]
    pub const fn is_at_capacity(&self) -> bool {
        self.active >= self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn rejects_when_full_without_queue() {
        let bulkhead = Bulkhead::new("db", BulkheadConfig::unqueued(2)).unwrap();

        let a = bulkhead.acquire().await.unwrap();
        let _b = bulkhead.acquire().await.unwrap();
        assert!(bulkhead.stats().is_at_capacity());

        let err = bulkhead.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::BulkheadRejected { reason: RejectReason::QueueFull, .. }
        ));

        drop(a);
        assert!(bulkhead.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let bulkhead = Bulkhead::new("db", BulkheadConfig::unqueued(1).with_queue_length(1)).unwrap();
        let held = bulkhead.acquire().await.unwrap();

        let waiter = bulkhead.clone();
        let parked = tokio::spawn(async move { waiter.acquire().await.map(drop) });
        while bulkhead.stats().waiting < 1 {
            tokio::task::yield_now().await;
        }

        let err = tokio::time::timeout(Duration::from_millis(50), bulkhead.acquire())
            .await
            .expect("a full queue must not park the caller")
            .unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::BulkheadRejected { reason: RejectReason::QueueFull, .. }
        ));
        assert_eq!(bulkhead.stats().rejected_total, 1);

        drop(held);
        assert!(parked.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_times_out() {
        let config = BulkheadConfig::unqueued(1)
            .with_queue_length(1)
            .with_queue_timeout(Duration::from_millis(100));
        let bulkhead = Bulkhead::new("api", config).unwrap();

        let _held = bulkhead.acquire().await.unwrap();
        let err = bulkhead.acquire().await.unwrap_err();

        assert!(matches!(
            err,
            ResilienceError::BulkheadRejected { reason: RejectReason::QueueTimeout, .. }
        ));
        assert_eq!(bulkhead.stats().waiting, 0);
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let bulkhead = Bulkhead::new("fifo", BulkheadConfig::unqueued(1).with_queue_length(8)).unwrap();
        let held = bulkhead.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for id in 0..4 {
            let waiter = bulkhead.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = waiter.acquire().await.unwrap();
                tx.send(id).unwrap();
            }));
            // Let each waiter enqueue before spawning the next.
            while bulkhead.stats().waiting < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn slot_released_when_call_is_cancelled() {
        let bulkhead = Bulkhead::new("cancel", BulkheadConfig::unqueued(1)).unwrap();
        let (started_tx, started_rx) = oneshot::channel();

        let b = bulkhead.clone();
        let task = tokio::spawn(async move {
            b.execute(|| async move {
                let _ = started_tx.send(());
                std::future::pending::<ResilienceResult<()>>().await
            })
            .await
        });

        started_rx.await.unwrap();
        assert_eq!(bulkhead.stats().active, 1);

        task.abort();
        let _ = task.await;
        assert_eq!(bulkhead.stats().active, 0);
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        assert!(Bulkhead::new("x", BulkheadConfig::unqueued(0)).is_err());
    }
}
