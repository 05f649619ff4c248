//! Near cache statistics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a near cache's counters.
///
/// Every counter except `entry_count` is monotonic over the lifetime of the
/// store, including across `clear()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Reads answered from the near cache.
    pub hit_count: u64,
    /// Reads that found nothing usable.
    pub miss_count: u64,
    /// Records currently held.
    pub entry_count: u64,
    /// Records removed to make room.
    pub evicted_count: u64,
    /// Records removed because their ttl or idle window passed.
    pub expired_count: u64,
}

impl CacheStatistics {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Live counters backing [`CacheStatistics`].
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evicted: AtomicU64,
    pub expired: AtomicU64,
}

impl StoreCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiry(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: usize) -> CacheStatistics {
        CacheStatistics {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
            evicted_count: self.evicted.load(Ordering::Relaxed),
            expired_count: self.expired.load(Ordering::Relaxed),
        }
    }
}
