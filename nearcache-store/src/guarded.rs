//! Cache store guarded by a key-state marker.

use std::sync::Arc;

use nearcache_core::{key_hash, partition_of, NearCacheConfig, NearCacheResult, PartitionId, PartitionService};

use crate::marker::{AlwaysSucceedingMarker, KeyState, KeyStateMarker, StripedKeyStateMarker};
use crate::stats::CacheStatistics;
use crate::store::{CacheKey, CacheLookup, CacheStore, CacheValue};

/// [`CacheStore`] plus the marker that linearizes populates against
/// invalidations.
#[derive(Debug)]
pub struct GuardedCacheStore<K, V> {
    store: CacheStore<K, V>,
    marker: Arc<dyn KeyStateMarker>,
}

impl<K: CacheKey, V: CacheValue> GuardedCacheStore<K, V> {
    /// Compose a store with an explicit marker.
    pub fn new(store: CacheStore<K, V>, marker: Arc<dyn KeyStateMarker>) -> Self {
        Self { store, marker }
    }

    /// Build the store for `config`, picking the marker it needs.
    ///
    /// Invalidate-on-change gets one slot per marker count; otherwise there is
    /// nothing to race against and the always-succeeding marker is used.
    pub fn from_config(config: &NearCacheConfig, marker_count: usize) -> NearCacheResult<Self> {
        let store = CacheStore::new(config)?;
        let marker: Arc<dyn KeyStateMarker> = if config.invalidate_on_change {
            Arc::new(StripedKeyStateMarker::new(marker_count))
        } else {
            Arc::new(AlwaysSucceedingMarker)
        };
        Ok(Self::new(store, marker))
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn marker(&self) -> &dyn KeyStateMarker {
        self.marker.as_ref()
    }

    /// Marker state for `key`'s slot.
    pub fn key_state(&self, key: &K) -> KeyState {
        self.marker.state(key_hash(key))
    }

    pub fn put(&self, key: K, value: Option<V>) {
        self.store.put(key, value);
    }

    pub fn get(&self, key: &K) -> CacheLookup<V> {
        self.store.get(key)
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.store.statistics()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Try to claim `key`'s slot ahead of a remote read.
    pub fn try_mark(&self, key: &K) -> bool {
        self.marker.mark_if_unmarked(key_hash(key))
    }

    /// Write a remotely fetched value if its slot is still marked.
    ///
    /// The marker transition and the write happen in one store critical
    /// section, so an invalidation either poisons the slot first (and the
    /// write is skipped) or runs its delete after the write. A skipped write
    /// leaves the slot forcibly unmarked. Returns whether the value was
    /// cached.
    pub fn publish_marked(&self, key: K, value: Option<V>) -> bool {
        let hash = key_hash(&key);
        let published = self
            .store
            .put_when(key, value, || self.marker.unmark_if_marked(hash));
        if !published {
            self.marker.unmark_forcibly(hash);
        }
        published
    }

    /// Release a mark without writing anything.
    pub fn release_mark(&self, key: &K) {
        self.marker.unmark_forcibly(key_hash(key));
    }

    /// Invalidate `key`.
    ///
    /// A populate in flight on the key's slot is poisoned before the delete,
    /// so it refuses to write afterwards.
    pub fn invalidate(&self, key: &K) {
        // Poison first: deleting first would let a populate that wins the
        // slot in between write a stale value back.
        self.marker.remove_if_marked(key_hash(key));
        // Runs even when the poison succeeded. Slots are shared, so the
        // populate holding this one may be for another key and would never
        // delete this key's record.
        self.store.invalidate(key);
    }

    /// Remove every entry owned by `partition_id`.
    ///
    /// A key that cannot be routed is removed as well.
    pub fn invalidate_partition(&self, partition_id: PartitionId, partitions: &dyn PartitionService) -> usize {
        self.store.invalidate_matching(|k| {
            partition_of(partitions, k).map_or(true, |owner| owner == partition_id)
        })
    }

    /// Drop every entry and release every mark.
    pub fn clear(&self) {
        self.marker.unmark_all_forcibly();
        self.store.clear();
    }
}
