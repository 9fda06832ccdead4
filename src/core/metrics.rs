//! Process metrics collector.
//!
//! A plain struct of atomic counters handed to components as `Arc<Metrics>`.
//! Each scheduler, importer and reconciler shares the instance it was built
//! with, so tests can create their own and assert on it in isolation.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the reconciliation, batch and import layers.
#[derive(Debug, Default)]
pub struct Metrics {
    journals_posted: AtomicU64,
    journals_duplicate: AtomicU64,
    reconcile_success: AtomicU64,
    reconcile_failed: AtomicU64,
    reconcile_skipped: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    rows_imported: AtomicU64,
    rows_skipped: AtomicU64,
    chunks_committed: AtomicU64,
    chunks_failed: AtomicU64,
    memory_pauses: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Journal entries written
    pub journals_posted: u64,
    /// Posts that found an existing entry for the same source key
    pub journals_duplicate: u64,
    /// Pairs reconciled successfully
    pub reconcile_success: u64,
    /// Pairs that failed
    pub reconcile_failed: u64,
    /// Pairs not attempted because the circuit breaker halted
    pub reconcile_skipped: u64,
    /// Batches finished with `completed`
    pub batches_completed: u64,
    /// Batches finished with `failed`
    pub batches_failed: u64,
    /// Import rows persisted
    pub rows_imported: u64,
    /// Import rows skipped as malformed or duplicate
    pub rows_skipped: u64,
    /// Import chunks committed
    pub chunks_committed: u64,
    /// Import chunks rolled back
    pub chunks_failed: u64,
    /// Times the importer paused for memory pressure
    pub memory_pauses: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[doc = concat!("Adds `n` to `", stringify!($field), "`.")]
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    /// Creates a collector with every counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_journals_posted, journals_posted);
    counter!(add_journals_duplicate, journals_duplicate);
    counter!(add_reconcile_success, reconcile_success);
    counter!(add_reconcile_failed, reconcile_failed);
    counter!(add_reconcile_skipped, reconcile_skipped);
    counter!(add_batches_completed, batches_completed);
    counter!(add_batches_failed, batches_failed);
    counter!(add_rows_imported, rows_imported);
    counter!(add_rows_skipped, rows_skipped);
    counter!(add_chunks_committed, chunks_committed);
    counter!(add_chunks_failed, chunks_failed);
    counter!(add_memory_pauses, memory_pauses);

    /// Reads every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            journals_posted: load(&self.journals_posted),
            journals_duplicate: load(&self.journals_duplicate),
            reconcile_success: load(&self.reconcile_success),
            reconcile_failed: load(&self.reconcile_failed),
            reconcile_skipped: load(&self.reconcile_skipped),
            batches_completed: load(&self.batches_completed),
            batches_failed: load(&self.batches_failed),
            rows_imported: load(&self.rows_imported),
            rows_skipped: load(&self.rows_skipped),
            chunks_committed: load(&self.chunks_committed),
            chunks_failed: load(&self.chunks_failed),
            memory_pauses: load(&self.memory_pauses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_instances_are_isolated() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.add_journals_posted(3);
        a.add_rows_imported(10);

        assert_eq!(a.snapshot().journals_posted, 3);
        assert_eq!(a.snapshot().rows_imported, 10);
        assert_eq!(b.snapshot(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(Metrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&metrics);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    m.add_reconcile_success(1);
                }
            }));
        }
        for h in handles {
            h.await.ok();
        }
        assert_eq!(metrics.snapshot().reconcile_success, 800);
    }
}
