//! Bounded local key/value store with eviction and expiry.
//!
//! The store never fails once built: encoding problems, poisoned locks and
//! undecodable records all degrade to "not cached".

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nearcache_core::{EvictionPolicy, InMemoryFormat, NearCacheConfig, NearCacheResult};
use rand::seq::IteratorRandom;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use crate::stats::{CacheStatistics, StoreCounters};

/// Values the near cache can hold.
///
/// Serializable so the store can keep them in [`InMemoryFormat::Binary`].
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Keys the near cache can hold.
///
/// Serializable so they can be routed to the partition that owns them.
pub trait CacheKey: Clone + Eq + Hash + Serialize + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Serialize + Send + Sync + 'static {}

/// Outcome of a store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<V> {
    /// A record is present. `None` means the remote map had no value and
    /// that absence was cached.
    Hit(Option<V>),
    /// Nothing usable is cached.
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    /// The cached value, flattening "hit, empty" and "miss" into `None`.
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Hit(value) => value,
            Self::Miss => None,
        }
    }
}

#[derive(Debug, Clone)]
enum StoredValue<V> {
    Empty,
    Object(V),
    Binary(Vec<u8>),
}

/// A single cached entry.
#[derive(Debug, Clone)]
struct CacheRecord<V> {
    value: StoredValue<V>,
    creation_time: Instant,
    last_access_time: Instant,
    access_hits: u64,
    /// `None` means the record never expires by age.
    ttl_deadline: Option<Instant>,
    /// Pushed forward on each access.
    idle_deadline: Option<Instant>,
}

impl<V> CacheRecord<V> {
    fn new(value: StoredValue<V>, now: Instant, ttl: Option<Duration>, idle: Option<Duration>) -> Self {
        Self {
            value,
            creation_time: now,
            last_access_time: now,
            access_hits: 0,
            ttl_deadline: ttl.map(|ttl| now + ttl),
            idle_deadline: idle.map(|idle| now + idle),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.ttl_deadline.is_some_and(|deadline| now >= deadline)
            || self.idle_deadline.is_some_and(|deadline| now >= deadline)
    }

    fn touch(&mut self, now: Instant, idle: Option<Duration>) {
        self.last_access_time = now;
        self.access_hits = self.access_hits.saturating_add(1);
        self.idle_deadline = idle.map(|idle| now + idle);
    }
}

/// Records plus the eviction candidates remembered between evictions.
struct StoreState<K, V> {
    records: HashMap<K, CacheRecord<V>>,
    eviction_pool: Vec<K>,
}

/// Bounded local key/value store.
pub struct CacheStore<K, V> {
    name: String,
    max_entries: usize,
    eviction_policy: EvictionPolicy,
    sampling_count: usize,
    sampling_pool_size: usize,
    time_to_live: Option<Duration>,
    max_idle: Option<Duration>,
    in_memory_format: InMemoryFormat,
    state: Mutex<StoreState<K, V>>,
    counters: StoreCounters,
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> {
    /// Create a store from a validated near cache config.
    pub fn new(config: &NearCacheConfig) -> NearCacheResult<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            max_entries: config.max_entries,
            eviction_policy: config.eviction_policy,
            sampling_count: config.eviction_sampling_count,
            sampling_pool_size: config.eviction_sampling_pool_size,
            time_to_live: config.time_to_live(),
            max_idle: config.max_idle(),
            in_memory_format: config.in_memory_format,
            state: Mutex::new(StoreState {
                records: HashMap::new(),
                eviction_pool: Vec::new(),
            }),
            counters: StoreCounters::default(),
        })
    }

    /// Name of the map this store caches.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, StoreState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a record with fresh timestamps.
    ///
    /// `None` caches the absence of a value. If the store then holds more
    /// than `max_entries` records, one other live record is evicted, or the
    /// expired records found while sampling are purged instead.
    pub fn put(&self, key: K, value: Option<V>) {
        let mut state = self.state();
        self.insert_locked(&mut state, key, value);
    }

    /// Insert only if `guard` returns true, evaluated under the store lock.
    ///
    /// Lets a caller make its check-and-act atomic with respect to every
    /// other store operation. Returns whether the write happened.
    pub fn put_when(&self, key: K, value: Option<V>, guard: impl FnOnce() -> bool) -> bool {
        let mut state = self.state();
        if !guard() {
            return false;
        }
        self.insert_locked(&mut state, key, value);
        true
    }

    fn insert_locked(&self, state: &mut StoreState<K, V>, key: K, value: Option<V>) {
        let stored = match self.encode(value) {
            Some(stored) => stored,
            None => {
                state.records.remove(&key);
                return;
            }
        };

        let now = Instant::now();
        let record = CacheRecord::new(stored, now, self.time_to_live, self.max_idle);
        state.records.insert(key.clone(), record);

        if self.eviction_policy.is_bounded() && state.records.len() > self.max_entries {
            self.evict_one(state, &key, now);
        }
    }

    fn encode(&self, value: Option<V>) -> Option<StoredValue<V>> {
        let Some(value) = value else {
            return Some(StoredValue::Empty);
        };
        match self.in_memory_format {
            InMemoryFormat::Object => Some(StoredValue::Object(value)),
            InMemoryFormat::Binary => match serde_json::to_vec(&value) {
                Ok(bytes) => Some(StoredValue::Binary(bytes)),
                Err(e) => {
                    tracing::warn!(map = %self.name, error = %e, "Value not cacheable, skipping");
                    None
                }
            },
        }
    }

    /// Remove one record other than `protected`.
    ///
    /// Draws `sampling_count` records at random. Expired records in the
    /// sample are purged and nothing else is evicted. Otherwise the sample
    /// joins the candidate pool, the pool is ranked by the policy and its
    /// worst record is evicted.
    fn evict_one(&self, state: &mut StoreState<K, V>, protected: &K, now: Instant) {
        let StoreState { records, eviction_pool } = state;
        let mut rng = rand::rng();

        if self.eviction_policy == EvictionPolicy::Random {
            let victim = records.keys().filter(|k| *k != protected).choose(&mut rng).cloned();
            if let Some(key) = victim {
                records.remove(&key);
                self.counters.record_eviction();
                tracing::trace!(map = %self.name, policy = ?self.eviction_policy, "Evicted record");
            }
            return;
        }

        let sample: Vec<K> = records
            .keys()
            .filter(|k| *k != protected)
            .choose_multiple(&mut rng, self.sampling_count)
            .into_iter()
            .cloned()
            .collect();

        let expired: Vec<&K> = sample
            .iter()
            .filter(|k| records.get(*k).is_some_and(|r| r.is_expired(now)))
            .collect();
        if !expired.is_empty() {
            for key in expired {
                records.remove(key);
                self.counters.record_expiry();
            }
            eviction_pool.retain(|k| records.contains_key(k));
            return;
        }

        eviction_pool.retain(|k| k != protected && records.contains_key(k));
        for key in sample {
            if !eviction_pool.contains(&key) {
                eviction_pool.push(key);
            }
        }
        match self.eviction_policy {
            EvictionPolicy::Lru => eviction_pool
                .sort_by_key(|k| records.get(k).map(|r| (r.last_access_time, r.creation_time))),
            EvictionPolicy::Lfu => eviction_pool
                .sort_by_key(|k| records.get(k).map(|r| (r.access_hits, r.last_access_time))),
            EvictionPolicy::Random | EvictionPolicy::None => {}
        }
        eviction_pool.truncate(self.sampling_pool_size);

        if eviction_pool.is_empty() {
            return;
        }
        let victim = eviction_pool.remove(0);
        records.remove(&victim);
        self.counters.record_eviction();
        tracing::trace!(map = %self.name, policy = ?self.eviction_policy, "Evicted record");
    }

    /// Read a record, expiring it first if its deadline has passed.
    pub fn get(&self, key: &K) -> CacheLookup<V> {
        let now = Instant::now();
        let mut state = self.state();
        let records = &mut state.records;

        let Some(record) = records.get_mut(key) else {
            self.counters.record_miss();
            return CacheLookup::Miss;
        };

        if record.is_expired(now) {
            records.remove(key);
            self.counters.record_expiry();
            self.counters.record_miss();
            return CacheLookup::Miss;
        }

        record.touch(now, self.max_idle);
        let decoded = match &record.value {
            StoredValue::Empty => Ok(None),
            StoredValue::Object(value) => Ok(Some(value.clone())),
            StoredValue::Binary(bytes) => serde_json::from_slice::<V>(bytes).map(Some),
        };

        match decoded {
            Ok(value) => {
                self.counters.record_hit();
                CacheLookup::Hit(value)
            }
            Err(e) => {
                tracing::warn!(map = %self.name, error = %e, "Dropping undecodable record");
                records.remove(key);
                self.counters.record_miss();
                CacheLookup::Miss
            }
        }
    }

    /// Remove a record. Returns whether one was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.state().records.remove(key).is_some()
    }

    /// Remove every record whose key matches `predicate`.
    ///
    /// Returns the number of records removed.
    pub fn invalidate_matching(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut state = self.state();
        let records = &mut state.records;
        let before = records.len();
        records.retain(|k, _| !predicate(k));
        before - records.len()
    }

    /// Remove all records. Lifetime counters are kept.
    pub fn clear(&self) {
        let mut state = self.state();
        state.records.clear();
        state.eviction_pool.clear();
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the store's counters.
    pub fn statistics(&self) -> CacheStatistics {
        let entry_count = self.len();
        self.counters.snapshot(entry_count)
    }
}

impl<K, V> std::fmt::Debug for CacheStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("eviction_policy", &self.eviction_policy)
            .field("in_memory_format", &self.in_memory_format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn store(config: NearCacheConfig) -> CacheStore<String, String> {
        CacheStore::new(&config).expect("valid config")
    }

    fn key(i: usize) -> String {
        format!("key-{}", i)
    }

    #[test]
    fn test_put_then_get_returns_latest() {
        let store = store(NearCacheConfig::new("m"));
        store.put(key(1), Some("a".to_string()));
        store.put(key(1), Some("b".to_string()));
        assert_eq!(store.get(&key(1)), CacheLookup::Hit(Some("b".to_string())));
        assert_eq!(store.statistics().entry_count, 1);
    }

    #[test]
    fn test_absent_and_cached_empty_are_distinct() {
        let store = store(NearCacheConfig::new("m"));
        store.put(key(1), None);
        assert_eq!(store.get(&key(1)), CacheLookup::Hit(None));
        assert_eq!(store.get(&key(2)), CacheLookup::Miss);

        let stats = store.statistics();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_object_format_roundtrips_value() {
        let store = store(NearCacheConfig::new("m").with_in_memory_format(InMemoryFormat::Object));
        store.put(key(1), Some("v".to_string()));
        assert_eq!(store.get(&key(1)).into_value(), Some("v".to_string()));
    }

    #[test]
    fn test_binary_format_decodes_structs() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
            total: i64,
        }

        let store: CacheStore<u32, Order> =
            CacheStore::new(&NearCacheConfig::new("orders")).expect("valid config");
        store.put(7, Some(Order { id: 7, total: 120 }));
        assert_eq!(
            store.get(&7),
            CacheLookup::Hit(Some(Order { id: 7, total: 120 }))
        );
    }

    #[test]
    fn test_invalidate_absent_key_is_noop() {
        let store = store(NearCacheConfig::new("m"));
        assert!(!store.invalidate(&key(1)));
        store.put(key(1), Some("a".to_string()));
        assert!(store.invalidate(&key(1)));
        assert!(store.get(&key(1)).is_miss());
    }

    #[test]
    fn test_invalidate_matching() {
        let store = store(NearCacheConfig::new("m"));
        for i in 0..10 {
            store.put(key(i), Some(i.to_string()));
        }
        let removed = store.invalidate_matching(|k| k.ends_with('3') || k.ends_with('4'));
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn test_clear_keeps_lifetime_counters() {
        let store = store(NearCacheConfig::new("m"));
        store.put(key(1), Some("a".to_string()));
        store.get(&key(1));
        store.get(&key(2));
        store.clear();

        let stats = store.statistics();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert!(store.get(&key(1)).is_miss());
    }

    #[test]
    fn test_overflow_evicts_exactly_one() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Lfu, EvictionPolicy::Random] {
            let store = store(
                NearCacheConfig::new("m")
                    .with_max_entries(5)
                    .with_eviction_policy(policy),
            );
            for i in 0..6 {
                store.put(key(i), Some(i.to_string()));
            }
            let stats = store.statistics();
            assert_eq!(stats.evicted_count, 1, "policy {:?}", policy);
            assert_eq!(stats.entry_count, 5, "policy {:?}", policy);
            assert!(store.get(&key(5)).is_hit(), "newest survives under {:?}", policy);
        }
    }

    #[test]
    fn test_no_eviction_grows_unbounded() {
        let store = store(
            NearCacheConfig::new("m")
                .with_max_entries(2)
                .with_eviction_policy(EvictionPolicy::None),
        );
        for i in 0..10 {
            store.put(key(i), Some(i.to_string()));
        }
        let stats = store.statistics();
        assert_eq!(stats.entry_count, 10);
        assert_eq!(stats.evicted_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_accessed() {
        let store = store(NearCacheConfig::new("m").with_max_entries(3));
        for i in 0..3 {
            store.put(key(i), Some(i.to_string()));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // key-0 becomes the most recently used.
        assert!(store.get(&key(0)).is_hit());
        tokio::time::advance(Duration::from_millis(10)).await;

        store.put(key(3), Some("3".to_string()));
        assert!(store.get(&key(1)).is_miss());
        assert!(store.get(&key(0)).is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lfu_evicts_least_frequently_accessed() {
        let store = store(
            NearCacheConfig::new("m")
                .with_max_entries(3)
                .with_eviction_policy(EvictionPolicy::Lfu),
        );
        for i in 0..3 {
            store.put(key(i), Some(i.to_string()));
        }
        for _ in 0..3 {
            store.get(&key(0));
            store.get(&key(2));
        }
        store.get(&key(1));

        store.put(key(3), Some("3".to_string()));
        assert!(store.get(&key(1)).is_miss());
        assert!(store.get(&key(0)).is_hit());
        assert!(store.get(&key(2)).is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = store(NearCacheConfig::new("m").with_time_to_live_seconds(10));
        store.put(key(1), Some("a".to_string()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get(&key(1)).is_hit());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.get(&key(1)).is_miss());

        let stats = store.statistics();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let store = store(NearCacheConfig::new("m"));
        store.put(key(1), Some("a".to_string()));
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(store.get(&key(1)).is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_window_resets_on_access() {
        let store = store(NearCacheConfig::new("m").with_max_idle_seconds(10));
        store.put(key(1), Some("hot".to_string()));
        store.put(key(2), Some("cold".to_string()));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(6)).await;
            assert!(store.get(&key(1)).is_hit());
        }
        assert!(store.get(&key(2)).is_miss());
        assert_eq!(store.statistics().expired_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_prefers_expired_record() {
        let store = store(
            NearCacheConfig::new("m")
                .with_max_entries(2)
                .with_max_idle_seconds(5),
        );
        store.put(key(1), Some("a".to_string()));
        tokio::time::advance(Duration::from_secs(4)).await;
        store.put(key(2), Some("b".to_string()));
        tokio::time::advance(Duration::from_secs(2)).await;

        store.put(key(3), Some("c".to_string()));
        let stats = store.statistics();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.evicted_count, 0);
        assert!(store.get(&key(2)).is_hit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampled_expired_records_are_purged_together() {
        let store = store(
            NearCacheConfig::new("m")
                .with_max_entries(3)
                .with_max_idle_seconds(5),
        );
        for i in 0..3 {
            store.put(key(i), Some(i.to_string()));
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        store.put(key(3), Some("3".to_string()));
        let stats = store.statistics();
        assert_eq!(stats.expired_count, 3);
        assert_eq!(stats.evicted_count, 0);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_single_sample_still_evicts_one_per_overflow() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Lfu] {
            let store = store(
                NearCacheConfig::new("m")
                    .with_max_entries(10)
                    .with_eviction_policy(policy)
                    .with_eviction_sampling_count(1)
                    .with_eviction_sampling_pool_size(1),
            );
            for i in 0..50 {
                store.put(key(i), Some(i.to_string()));
            }
            let stats = store.statistics();
            assert_eq!(stats.evicted_count, 40, "policy {:?}", policy);
            assert_eq!(stats.entry_count, 10, "policy {:?}", policy);
            assert!(store.get(&key(49)).is_hit(), "newest survives under {:?}", policy);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_forgets_removed_candidates() {
        let store = store(
            NearCacheConfig::new("m")
                .with_max_entries(3)
                .with_eviction_sampling_count(3),
        );
        for i in 0..3 {
            store.put(key(i), Some(i.to_string()));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // Evicts key-0 and leaves key-1 and key-2 pooled.
        store.put(key(3), Some("3".to_string()));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(store.get(&key(1)).is_hit());

        assert!(store.invalidate(&key(2)));
        store.put(key(4), Some("4".to_string()));
        tokio::time::advance(Duration::from_millis(10)).await;
        store.put(key(5), Some("5".to_string()));

        let stats = store.statistics();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.evicted_count, 2);
        assert!(store.get(&key(3)).is_miss());
        assert!(store.get(&key(2)).is_miss());
        assert!(store.get(&key(1)).is_hit());
        assert!(store.get(&key(5)).is_hit());
    }

    #[test]
    fn test_put_when_respects_guard() {
        let store = store(NearCacheConfig::new("m"));
        assert!(!store.put_when(key(1), Some("a".to_string()), || false));
        assert!(store.get(&key(1)).is_miss());
        assert!(store.put_when(key(1), Some("a".to_string()), || true));
        assert!(store.get(&key(1)).is_hit());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result: NearCacheResult<CacheStore<String, String>> =
            CacheStore::new(&NearCacheConfig::new("m").with_max_entries(0));
        assert!(result.is_err());
    }
}
