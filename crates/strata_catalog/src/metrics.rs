//! In-process counters for catalog lookups and the table cache.
//!
//! These are intentionally lightweight and lock-free so they can be updated
//! on hot read paths without noticeable overhead; an exporter samples
//! [`CatalogMetrics::snapshot`] on its own schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::sieve::SieveStatusHook;

/// Aggregated counters for the catalog core.
#[derive(Debug, Default)]
pub struct CatalogMetrics {
    /// Lookups by name answered from the table cache.
    table_by_name_hits: AtomicU64,
    /// Sum of hit-path latency in nanoseconds.
    table_by_name_hit_latency_ns: AtomicU64,
    /// Lookups by name that had to reload from the metadata store.
    table_by_name_misses: AtomicU64,
    /// Sum of miss-path latency in nanoseconds.
    table_by_name_miss_latency_ns: AtomicU64,
    /// Table cache hits across all lookup paths.
    cache_hits: AtomicU64,
    /// Table cache misses across all lookup paths.
    cache_misses: AtomicU64,
    /// Entries evicted from the table cache.
    cache_evictions: AtomicU64,
    /// Bytes reclaimed by cache evictions.
    cache_evicted_bytes: AtomicU64,
    /// Descriptor loads issued to the metadata store (after coalescing).
    table_loads: AtomicU64,
    /// Retries caused by the transient flashback condition.
    flashback_retries: AtomicU64,
}

impl CatalogMetrics {
    pub fn observe_table_by_name_hit(&self, elapsed: Duration) {
        self.table_by_name_hits.fetch_add(1, Ordering::Relaxed);
        self.table_by_name_hit_latency_ns
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn observe_table_by_name_miss(&self, elapsed: Duration) {
        self.table_by_name_misses.fetch_add(1, Ordering::Relaxed);
        self.table_by_name_miss_latency_ns
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn inc_table_loads(&self) {
        self.table_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flashback_retries(&self) {
        self.flashback_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> CatalogMetricsSnapshot {
        CatalogMetricsSnapshot {
            table_by_name_hits: self.table_by_name_hits.load(Ordering::Relaxed),
            table_by_name_hit_latency_ns: self.table_by_name_hit_latency_ns.load(Ordering::Relaxed),
            table_by_name_misses: self.table_by_name_misses.load(Ordering::Relaxed),
            table_by_name_miss_latency_ns: self
                .table_by_name_miss_latency_ns
                .load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_evicted_bytes: self.cache_evicted_bytes.load(Ordering::Relaxed),
            table_loads: self.table_loads.load(Ordering::Relaxed),
            flashback_retries: self.flashback_retries.load(Ordering::Relaxed),
        }
    }
}

/// Exported view of [`CatalogMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogMetricsSnapshot {
    pub table_by_name_hits: u64,
    pub table_by_name_hit_latency_ns: u64,
    pub table_by_name_misses: u64,
    pub table_by_name_miss_latency_ns: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_evicted_bytes: u64,
    pub table_loads: u64,
    pub flashback_retries: u64,
}

/// Sieve status hook feeding [`CatalogMetrics`].
pub(crate) struct MetricsStatusHook(pub Arc<CatalogMetrics>);

impl SieveStatusHook for MetricsStatusHook {
    fn on_hit(&self) {
        self.0.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_miss(&self) {
        self.0.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_evict(&self, bytes: u64) {
        self.0.cache_evictions.fetch_add(1, Ordering::Relaxed);
        self.0.cache_evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_observations() {
        let metrics = CatalogMetrics::default();
        metrics.observe_table_by_name_hit(Duration::from_micros(5));
        metrics.observe_table_by_name_miss(Duration::from_micros(7));
        metrics.inc_table_loads();

        let snap = metrics.snapshot();
        assert_eq!(snap.table_by_name_hits, 1);
        assert_eq!(snap.table_by_name_hit_latency_ns, 5_000);
        assert_eq!(snap.table_by_name_misses, 1);
        assert_eq!(snap.table_by_name_miss_latency_ns, 7_000);
        assert_eq!(snap.table_loads, 1);
    }

    #[test]
    fn hook_feeds_cache_counters() {
        let metrics = Arc::new(CatalogMetrics::default());
        let hook = MetricsStatusHook(metrics.clone());
        hook.on_hit();
        hook.on_miss();
        hook.on_evict(128);

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_evictions, 1);
        assert_eq!(snap.cache_evicted_bytes, 128);
    }
}
