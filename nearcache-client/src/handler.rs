//! Invalidation handling, selected once per near cache by cluster capability.

use std::sync::Arc;

use nearcache_invalidation::InvalidationTracker;
use nearcache_store::{CacheKey, CacheValue, GuardedCacheStore};

use crate::remote::{InvalidationEvent, ListenerKind};

/// Applies pushed invalidation events to a near cache.
pub trait InvalidationHandler<K>: Send + Sync {
    /// Stream this handler understands.
    fn kind(&self) -> ListenerKind;

    fn handle(&self, event: InvalidationEvent<K>);
}

/// Pre-3.8 clusters: invalidate on every event, no sequence tracking.
pub struct LegacyInvalidationHandler<K, V> {
    store: Arc<GuardedCacheStore<K, V>>,
}

impl<K: CacheKey, V: CacheValue> LegacyInvalidationHandler<K, V> {
    pub fn new(store: Arc<GuardedCacheStore<K, V>>) -> Self {
        Self { store }
    }
}

impl<K: CacheKey, V: CacheValue> InvalidationHandler<K> for LegacyInvalidationHandler<K, V> {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Legacy
    }

    fn handle(&self, event: InvalidationEvent<K>) {
        match event {
            InvalidationEvent::LegacySingle { key } | InvalidationEvent::Single { key, .. } => match key {
                Some(key) => self.store.invalidate(&key),
                None => self.store.clear(),
            },
            InvalidationEvent::LegacyBatch { keys } | InvalidationEvent::Batch { keys, .. } => {
                for key in &keys {
                    self.store.invalidate(key);
                }
            }
        }
    }
}

/// 3.8+ clusters: route events through the sequence tracker.
pub struct SequenceAwareInvalidationHandler<K, V> {
    tracker: Arc<InvalidationTracker<K, V>>,
}

impl<K: CacheKey, V: CacheValue> SequenceAwareInvalidationHandler<K, V> {
    pub fn new(tracker: Arc<InvalidationTracker<K, V>>) -> Self {
        Self { tracker }
    }
}

impl<K: CacheKey, V: CacheValue> InvalidationHandler<K> for SequenceAwareInvalidationHandler<K, V> {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Sequenced
    }

    fn handle(&self, event: InvalidationEvent<K>) {
        match event {
            InvalidationEvent::Single {
                key,
                generation_id,
                sequence,
            } => self.tracker.handle(key.as_ref(), generation_id, sequence),
            InvalidationEvent::Batch {
                keys,
                generation_ids,
                sequences,
            } => self.tracker.handle_batch(&keys, &generation_ids, &sequences),
            InvalidationEvent::LegacySingle { key } => {
                tracing::debug!(map = %self.tracker.name(), "Unsequenced event on sequenced listener");
                match key {
                    Some(key) => self.tracker.store().invalidate(&key),
                    None => self.tracker.store().clear(),
                }
            }
            InvalidationEvent::LegacyBatch { keys } => {
                tracing::debug!(map = %self.tracker.name(), "Unsequenced event on sequenced listener");
                for key in &keys {
                    self.tracker.store().invalidate(key);
                }
            }
        }
    }
}
