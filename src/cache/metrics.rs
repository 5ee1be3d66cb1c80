//! Cache Metrics Collection
//!
//! Per-instance counters for the hot-key cache. The process-wide Prometheus
//! counters are updated alongside.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::{CACHE_LOOKUPS, CACHE_WRITE_BACKS};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    cold: AtomicU64,
    corrupt: AtomicU64,
    errors: AtomicU64,
    write_backs: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot read served from the cached payload
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
    }

    /// Hot read with no cached payload
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
    }

    pub fn record_cold(&self) {
        self.cold.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["cold"]).inc();
    }

    /// Cached payload that failed to deserialize
    pub fn record_corrupt(&self) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["corrupt"]).inc();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        CACHE_LOOKUPS.with_label_values(&["error"]).inc();
    }

    pub fn record_write_back(&self) {
        self.write_backs.fetch_add(1, Ordering::Relaxed);
        CACHE_WRITE_BACKS.inc();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Share of hot reads answered from the cache
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64 + self.corrupt.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            cold: self.cold.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.cold.store(0, Ordering::Relaxed);
        self.corrupt.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.write_backs.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the cache metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub cold: u64,
    pub corrupt: u64,
    pub errors: u64,
    pub write_backs: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_cold();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.cold, 1);
        assert!((snap.hit_ratio - 0.75).abs() < f64::EPSILON);

        metrics.reset();
        assert_eq!(metrics.snapshot().hits, 0);
    }
}
