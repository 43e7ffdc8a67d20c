//! Metrics and reporting for cache operations.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache operation metrics (thread-safe counters).
///
/// Clones share the same counters, so one instance can be handed to the
/// protocol and the stash.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Requests answered from storage
    pub storage_hits: Arc<AtomicU64>,
    /// Requests that missed storage and went to the stash
    pub storage_misses: Arc<AtomicU64>,
    /// Upstream fetches started (one per leader)
    pub upstream_fetches: Arc<AtomicU64>,
    /// Callers that joined an in-flight fetch instead of starting one
    pub joined_fetches: Arc<AtomicU64>,
    /// Fetch attempts that failed (upstream or save)
    pub failed_fetches: Arc<AtomicU64>,
    /// Manifests synthesized for modules without one
    pub synthesized_manifests: Arc<AtomicU64>,
}

impl CacheMetrics {
    pub fn record_storage_hit(&self) {
        self.storage_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_miss(&self) {
        self.storage_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_fetch(&self) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined_fetch(&self) {
        self.joined_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_fetch(&self) {
        self.failed_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_synthesized_manifest(&self) {
        self.synthesized_manifests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            storage_hits: self.storage_hits.load(Ordering::Relaxed),
            storage_misses: self.storage_misses.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            joined_fetches: self.joined_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            synthesized_manifests: self.synthesized_manifests.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics (for reporting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub storage_hits: u64,
    pub storage_misses: u64,
    pub upstream_fetches: u64,
    pub joined_fetches: u64,
    pub failed_fetches: u64,
    pub synthesized_manifests: u64,
}

impl MetricsSnapshot {
    /// Fraction of requests served from storage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.storage_hits + self.storage_misses;
        if total == 0 {
            0.0
        } else {
            self.storage_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = CacheMetrics::default();
        let shared = metrics.clone();
        shared.record_storage_hit();
        shared.record_storage_hit();
        shared.record_storage_hit();
        metrics.record_storage_miss();
        metrics.record_upstream_fetch();

        let snap = metrics.snapshot();
        assert_eq!(snap.storage_hits, 3);
        assert_eq!(snap.upstream_fetches, 1);
        assert!((snap.hit_rate() - 0.75).abs() < f64::EPSILON);

        assert_eq!(CacheMetrics::default().snapshot().hit_rate(), 0.0);
    }
}
