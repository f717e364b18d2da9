//! Aggregated, lock-free counters for cache observability.
//!
//! Mirrors the `CacheMetrics` counter set used elsewhere in this codebase for
//! its own HTTP-layer cache: plain `AtomicU64`s snapshotted into a plain
//! struct for external exporters to poll.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    loader_invocations: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loader_invocation(&self) {
        self.loader_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        MetricsSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            loader_invocations: self.loader_invocations.load(Ordering::Relaxed),
            hit_rate: {
                let total = (hits + misses) as f64;
                if total == 0.0 {
                    0.0
                } else {
                    hits as f64 / total
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub loader_invocations: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_computed_from_counters() {
        let m = CacheMetrics::default();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        let s = m.snapshot();
        assert_eq!(s.hits, 2);
        assert_eq!(s.misses, 1);
        assert!((s.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn hit_rate_is_zero_with_no_traffic() {
        let m = CacheMetrics::default();
        assert_eq!(m.snapshot().hit_rate, 0.0);
    }
}
