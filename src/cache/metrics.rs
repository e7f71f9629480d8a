use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing how well the cache is absorbing reads and writes.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches_started: AtomicU64,
    fetches_deduplicated: AtomicU64,
    fetch_retries: AtomicU64,
    fetch_failures: AtomicU64,
    mutations_committed: AtomicU64,
    mutations_rolled_back: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches_started: u64,
    pub fetches_deduplicated: u64,
    pub fetch_retries: u64,
    pub fetch_failures: u64,
    pub mutations_committed: u64,
    pub mutations_rolled_back: u64,
}

impl SyncMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.fetches_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.mutations_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.mutations_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_deduplicated: self.fetches_deduplicated.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            mutations_committed: self.mutations_committed.load(Ordering::Relaxed),
            mutations_rolled_back: self.mutations_rolled_back.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter (useful for periodic reporting)
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.stale_hits,
            &self.misses,
            &self.fetches_started,
            &self.fetches_deduplicated,
            &self.fetch_retries,
            &self.fetch_failures,
            &self.mutations_committed,
            &self.mutations_rolled_back,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl SyncMetricsSnapshot {
    /// Share of resolves answered from cache, stale answers included (0.0 to 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                served as f64 / total as f64
            }
        }
    }
}
