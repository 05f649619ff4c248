//! Sequence-aware invalidation tracking for one near-cached map.
//!
//! # Partition lifecycle
//!
//! ```text
//! Uninitialized ── first event ──→ Tracking ── seq = last+1 ──→ Tracking
//!                                     │
//!                                seq > last+1 ──→ Tracking (misses counted)
//!                                     │
//!                           generation changed ──→ partition cleared, Tracking
//! ```
//!
//! When the misses summed over all partitions pass the tolerated count, the
//! whole near cache is cleared and every partition returns to Uninitialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use nearcache_core::{
    partition_of, GenerationId, NearCacheResult, PartitionId, PartitionService, ReconciliationConfig,
    Sequence,
};
use nearcache_store::{CacheKey, CacheValue, GuardedCacheStore};

use crate::metadata::{PartitionInvalidationMetadata, PartitionMetadataSnapshot, SequenceCheck};

/// Anything the reconciliation scheduler can repair.
pub trait Reconcilable: Send + Sync {
    /// Name of the map being tracked.
    fn map_name(&self) -> &str;

    /// Lost invalidations detected since the last reset.
    fn missed_count(&self) -> u64;

    /// Compare local metadata with the cluster's and repair drift.
    fn reconcile(&self, authoritative: &[PartitionMetadataSnapshot]) -> ReconcileOutcome;
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Partitions seen for the first time.
    pub partitions_initialized: usize,
    /// Partitions whose entries were dropped.
    pub partitions_cleared: usize,
    /// Entries removed across those partitions.
    pub entries_removed: usize,
}

impl ReconcileOutcome {
    pub fn repaired_anything(&self) -> bool {
        self.partitions_cleared > 0
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    partitions: HashMap<PartitionId, PartitionInvalidationMetadata>,
    missed_total: u64,
}

enum Repair {
    None,
    ClearPartition(PartitionId),
    ClearAll,
}

/// Applies pushed invalidations to a guarded store and watches for gaps.
pub struct InvalidationTracker<K, V> {
    name: String,
    store: Arc<GuardedCacheStore<K, V>>,
    partitions: Arc<dyn PartitionService>,
    max_tolerated_miss_count: u64,
    sequence_lag_tolerance: u64,
    state: Mutex<TrackerState>,
}

impl<K: CacheKey, V: CacheValue> InvalidationTracker<K, V> {
    pub fn new(
        store: Arc<GuardedCacheStore<K, V>>,
        partitions: Arc<dyn PartitionService>,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            name: store.name().to_string(),
            store,
            partitions,
            max_tolerated_miss_count: config.max_tolerated_miss_count,
            sequence_lag_tolerance: config.sequence_lag_tolerance,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<GuardedCacheStore<K, V>> {
        &self.store
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, key: Option<&K>) -> NearCacheResult<PartitionId> {
        // Map-wide events are routed by the map name.
        match key {
            Some(key) => partition_of(self.partitions.as_ref(), key),
            None => partition_of(self.partitions.as_ref(), self.name.as_str()),
        }
    }

    /// Apply one invalidation. A `None` key clears the whole near cache.
    pub fn handle(&self, key: Option<&K>, generation_id: GenerationId, sequence: Sequence) {
        match key {
            Some(key) => self.store.invalidate(key),
            None => self.store.clear(),
        }

        match self.route(key) {
            Ok(partition_id) => {
                let repair = self.record(partition_id, generation_id, sequence);
                self.apply(repair);
            }
            Err(e) => {
                tracing::warn!(
                    map = %self.name,
                    error = %e,
                    sequence,
                    "Invalidation not routable, sequence not tracked"
                );
            }
        }
    }

    /// Apply a batch of invalidations, each independently and in order.
    ///
    /// The three slices are parallel. Trailing elements of longer slices are
    /// ignored.
    pub fn handle_batch(&self, keys: &[K], generation_ids: &[GenerationId], sequences: &[Sequence]) {
        let len = keys.len().min(generation_ids.len()).min(sequences.len());
        if len != keys.len() || len != generation_ids.len() || len != sequences.len() {
            tracing::warn!(
                map = %self.name,
                keys = keys.len(),
                generation_ids = generation_ids.len(),
                sequences = sequences.len(),
                "Malformed invalidation batch, applying common prefix"
            );
        }
        for i in 0..len {
            self.handle(Some(&keys[i]), generation_ids[i], sequences[i]);
        }
    }

    fn record(&self, partition_id: PartitionId, generation_id: GenerationId, sequence: Sequence) -> Repair {
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(meta) = state.partitions.get_mut(&partition_id) else {
            state
                .partitions
                .insert(partition_id, PartitionInvalidationMetadata::new(generation_id, sequence));
            tracing::trace!(map = %self.name, partition = partition_id, sequence, "Partition tracking started");
            return Repair::None;
        };

        if meta.generation_id != generation_id {
            let dropped_misses = meta.miss_count;
            tracing::warn!(
                map = %self.name,
                partition = partition_id,
                old_generation = %meta.generation_id,
                new_generation = %generation_id,
                "Partition generation changed, clearing its entries"
            );
            *meta = PartitionInvalidationMetadata::new(generation_id, sequence);
            state.missed_total = state.missed_total.saturating_sub(dropped_misses);
            return Repair::ClearPartition(partition_id);
        }

        match meta.advance(sequence) {
            SequenceCheck::Gap { missed } => {
                state.missed_total = state.missed_total.saturating_add(missed);
                tracing::debug!(
                    map = %self.name,
                    partition = partition_id,
                    missed,
                    missed_total = state.missed_total,
                    "Lost invalidations detected"
                );
            }
            SequenceCheck::InOrder | SequenceCheck::Stale => {}
        }

        if state.missed_total > self.max_tolerated_miss_count {
            tracing::warn!(
                map = %self.name,
                missed_total = state.missed_total,
                tolerated = self.max_tolerated_miss_count,
                "Too many lost invalidations, clearing near cache"
            );
            state.partitions.clear();
            state.missed_total = 0;
            return Repair::ClearAll;
        }

        Repair::None
    }

    fn apply(&self, repair: Repair) -> usize {
        match repair {
            Repair::None => 0,
            Repair::ClearPartition(partition_id) => self
                .store
                .invalidate_partition(partition_id, self.partitions.as_ref()),
            Repair::ClearAll => {
                let removed = self.store.len();
                self.store.clear();
                removed
            }
        }
    }

    /// Local metadata for a partition, `None` while uninitialized.
    pub fn metadata(&self, partition_id: PartitionId) -> Option<PartitionInvalidationMetadata> {
        self.state().partitions.get(&partition_id).copied()
    }

    /// Partition a key is tracked under.
    pub fn partition_for(&self, key: &K) -> NearCacheResult<PartitionId> {
        self.route(Some(key))
    }
}

impl<K: CacheKey, V: CacheValue> Reconcilable for InvalidationTracker<K, V> {
    fn map_name(&self) -> &str {
        &self.name
    }

    fn missed_count(&self) -> u64 {
        self.state().missed_total
    }

    fn reconcile(&self, authoritative: &[PartitionMetadataSnapshot]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut to_clear = Vec::new();

        {
            let mut guard = self.state();
            let state = &mut *guard;
            for snapshot in authoritative {
                let Some(meta) = state.partitions.get_mut(&snapshot.partition_id) else {
                    state.partitions.insert(
                        snapshot.partition_id,
                        PartitionInvalidationMetadata::new(snapshot.generation_id, snapshot.sequence),
                    );
                    outcome.partitions_initialized += 1;
                    continue;
                };

                let stale_generation = meta.generation_id != snapshot.generation_id;
                let lag = meta.lag_behind(snapshot.sequence);
                if !stale_generation && lag <= self.sequence_lag_tolerance {
                    continue;
                }

                tracing::debug!(
                    map = %self.name,
                    partition = snapshot.partition_id,
                    stale_generation,
                    lag,
                    tracked_for_secs = meta.age(Utc::now()).num_seconds(),
                    "Repairing drifted partition"
                );
                let dropped_misses = meta.miss_count;
                *meta = PartitionInvalidationMetadata::new(snapshot.generation_id, snapshot.sequence);
                state.missed_total = state.missed_total.saturating_sub(dropped_misses);
                to_clear.push(snapshot.partition_id);
            }
        }

        for partition_id in to_clear {
            outcome.entries_removed += self.apply(Repair::ClearPartition(partition_id));
            outcome.partitions_cleared += 1;
        }
        outcome
    }
}

impl<K, V> std::fmt::Debug for InvalidationTracker<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationTracker")
            .field("name", &self.name)
            .field("max_tolerated_miss_count", &self.max_tolerated_miss_count)
            .field("sequence_lag_tolerance", &self.sequence_lag_tolerance)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearcache_core::{HashPartitionService, NearCacheConfig};
    use uuid::Uuid;

    const PARTITIONS: u32 = 4;

    fn tracker(max_misses: u64) -> InvalidationTracker<String, String> {
        let store = Arc::new(
            GuardedCacheStore::from_config(&NearCacheConfig::new("orders"), PARTITIONS as usize)
                .expect("valid config"),
        );
        let partitions: Arc<dyn PartitionService> =
            Arc::new(HashPartitionService::new(PARTITIONS).expect("valid"));
        let config = ReconciliationConfig {
            max_tolerated_miss_count: max_misses,
            ..ReconciliationConfig::default()
        };
        InvalidationTracker::new(store, partitions, &config)
    }

    /// Keys grouped by partition, `per_partition` of each.
    fn keys_by_partition(
        tracker: &InvalidationTracker<String, String>,
        per_partition: usize,
    ) -> HashMap<PartitionId, Vec<String>> {
        let mut by_partition: HashMap<PartitionId, Vec<String>> = HashMap::new();
        let mut i = 0;
        while by_partition.len() < PARTITIONS as usize
            || by_partition.values().any(|keys| keys.len() < per_partition)
        {
            let key = format!("key-{}", i);
            let partition_id = tracker.partition_for(&key).expect("routable");
            let keys = by_partition.entry(partition_id).or_default();
            if keys.len() < per_partition {
                keys.push(key);
            }
            i += 1;
        }
        by_partition
    }

    fn fill(tracker: &InvalidationTracker<String, String>, keys: &[String]) {
        for key in keys {
            tracker.store().put(key.clone(), Some(format!("v-{}", key)));
        }
    }

    #[test]
    fn test_first_event_starts_tracking() {
        let tracker = tracker(10);
        let key = "a".to_string();
        let pid = tracker.partition_for(&key).expect("routable");
        let generation = Uuid::now_v7();

        assert!(tracker.metadata(pid).is_none());
        tracker.handle(Some(&key), generation, 5);

        let meta = tracker.metadata(pid).expect("tracking");
        assert_eq!(meta.generation_id, generation);
        assert_eq!(meta.last_sequence, 5);
        assert_eq!(tracker.missed_count(), 0);
    }

    #[test]
    fn test_event_invalidates_key() {
        let tracker = tracker(10);
        let key = "a".to_string();
        tracker.store().put(key.clone(), Some("v".to_string()));
        tracker.handle(Some(&key), Uuid::now_v7(), 1);
        assert!(tracker.store().get(&key).is_miss());
    }

    #[test]
    fn test_sequence_gap_counts_misses() {
        let tracker = tracker(10);
        let key = "a".to_string();
        let generation = Uuid::now_v7();
        tracker.handle(Some(&key), generation, 1);
        tracker.handle(Some(&key), generation, 2);
        tracker.handle(Some(&key), generation, 5);

        assert_eq!(tracker.missed_count(), 2);
        let meta = tracker.metadata(tracker.partition_for(&key).expect("routable")).expect("tracking");
        assert_eq!(meta.last_sequence, 5);
        assert_eq!(meta.miss_count, 2);
    }

    #[test]
    fn test_threshold_breach_clears_everything() {
        let tracker = tracker(3);
        let keys = keys_by_partition(&tracker, 2);
        let all: Vec<String> = keys.values().flatten().cloned().collect();
        fill(&tracker, &all);

        let key = &all[0];
        let generation = Uuid::now_v7();
        tracker.handle(Some(key), generation, 1);
        tracker.handle(Some(key), generation, 4);
        assert_eq!(tracker.missed_count(), 2);
        assert!(tracker.store().len() > 0);

        tracker.handle(Some(key), generation, 7);
        assert_eq!(tracker.missed_count(), 0);
        assert_eq!(tracker.store().len(), 0);
        for pid in 0..PARTITIONS {
            assert!(tracker.metadata(pid).is_none());
        }
    }

    #[test]
    fn test_generation_change_clears_only_that_partition() {
        let tracker = tracker(10);
        let keys = keys_by_partition(&tracker, 3);
        let all: Vec<String> = keys.values().flatten().cloned().collect();
        fill(&tracker, &all);

        let (&pid, partition_keys) = keys.iter().next().expect("partition");
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        tracker.handle(Some(&partition_keys[0]), first, 10);
        tracker.handle(Some(&partition_keys[0]), second, 1);

        for key in partition_keys {
            assert!(tracker.store().get(key).is_miss());
        }
        for (other, other_keys) in &keys {
            if *other != pid {
                for key in other_keys {
                    assert!(tracker.store().get(key).is_hit());
                }
            }
        }
        let meta = tracker.metadata(pid).expect("tracking");
        assert_eq!(meta.generation_id, second);
        assert_eq!(meta.last_sequence, 1);
    }

    #[test]
    fn test_null_key_clears_near_cache() {
        let tracker = tracker(10);
        let keys = vec!["a".to_string(), "b".to_string()];
        fill(&tracker, &keys);
        tracker.handle(None, Uuid::now_v7(), 1);
        assert_eq!(tracker.store().len(), 0);
    }

    #[test]
    fn test_handle_batch_applies_in_order() {
        let tracker = tracker(10);
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        fill(&tracker, &keys);
        let generation = Uuid::now_v7();

        tracker.handle_batch(&keys, &[generation; 3], &[1, 2, 3]);
        for key in &keys {
            assert!(tracker.store().get(key).is_miss());
        }
    }

    #[test]
    fn test_handle_batch_tolerates_length_mismatch() {
        let tracker = tracker(10);
        let keys = vec!["a".to_string(), "b".to_string()];
        fill(&tracker, &keys);
        tracker.handle_batch(&keys, &[Uuid::now_v7()], &[1, 2]);
        assert!(tracker.store().get(&keys[0]).is_miss());
        assert!(tracker.store().get(&keys[1]).is_hit());
    }

    #[test]
    fn test_reconcile_initializes_unknown_partitions() {
        let tracker = tracker(10);
        let generation = Uuid::now_v7();
        let snapshots: Vec<_> = (0..PARTITIONS)
            .map(|pid| PartitionMetadataSnapshot {
                partition_id: pid,
                generation_id: generation,
                sequence: 42,
            })
            .collect();

        let outcome = tracker.reconcile(&snapshots);
        assert_eq!(outcome.partitions_initialized, PARTITIONS as usize);
        assert!(!outcome.repaired_anything());
        assert_eq!(tracker.metadata(0).expect("tracking").last_sequence, 42);
    }

    #[test]
    fn test_reconcile_repairs_stale_generation_and_lag() {
        let tracker = tracker(10);
        let keys = keys_by_partition(&tracker, 2);
        let all: Vec<String> = keys.values().flatten().cloned().collect();
        fill(&tracker, &all);

        let generation = Uuid::now_v7();
        let snapshots: Vec<_> = (0..PARTITIONS)
            .map(|pid| PartitionMetadataSnapshot {
                partition_id: pid,
                generation_id: generation,
                sequence: 1,
            })
            .collect();
        tracker.reconcile(&snapshots);

        // Partition 0 migrated, partition 1 lost an invalidation.
        let mut drifted = snapshots.clone();
        drifted[0].generation_id = Uuid::now_v7();
        drifted[1].sequence = 2;
        let initialized_at = tracker.metadata(0).expect("tracking").observed_at;

        let outcome = tracker.reconcile(&drifted);
        assert_eq!(outcome.partitions_cleared, 2);
        assert_eq!(outcome.entries_removed, 4);
        for key in keys[&0].iter().chain(keys[&1].iter()) {
            assert!(tracker.store().get(key).is_miss());
        }
        for key in keys[&2].iter().chain(keys[&3].iter()) {
            assert!(tracker.store().get(key).is_hit());
        }
        assert_eq!(tracker.metadata(1).expect("tracking").last_sequence, 2);
        assert!(tracker.metadata(0).expect("tracking").observed_at >= initialized_at);
    }

    #[test]
    fn test_reconcile_in_sync_is_noop() {
        let tracker = tracker(10);
        let generation = Uuid::now_v7();
        let snapshot = [PartitionMetadataSnapshot {
            partition_id: 0,
            generation_id: generation,
            sequence: 3,
        }];
        tracker.reconcile(&snapshot);
        let initialized_at = tracker.metadata(0).expect("tracking").observed_at;
        let outcome = tracker.reconcile(&snapshot);
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(tracker.metadata(0).expect("tracking").observed_at, initialized_at);
    }
}
