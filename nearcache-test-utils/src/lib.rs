//! Near Cache Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - An in-memory remote map that pushes invalidations and can hold reads or
//!   fail reads and unsubscribes on demand
//! - Static invalidation metadata source
//! - Proptest generators for configuration
//! - Fixtures wiring a client to an in-memory map
//! - Tracing initialisation for test output

pub use nearcache_client::{
    CachedMapClient, InvalidationEvent, InvalidationListener, ListenerKind, RemoteMapService,
    SubscriptionId, SubscriptionTopic,
};
pub use nearcache_core::{
    EvictionPolicy, HashPartitionService, InMemoryFormat, NearCacheConfig, NearCacheError,
    NearCacheResult, PartitionService, ReconciliationConfig, RemoteError, RemoteResult,
    ServerVersion,
};
pub use nearcache_invalidation::{
    InvalidationMetadataSource, MapInvalidationMetadata, PartitionMetadataSnapshot,
    ReconciliationScheduler,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearcache_core::{partition_of, GenerationId, PartitionId, Sequence};
use nearcache_store::{CacheKey, CacheValue};
use tokio::sync::Notify;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// REQUEST GATE
// ============================================================================

/// Holds remote reads until released, so tests can interleave events with
/// an outstanding call.
#[derive(Debug, Default)]
pub struct RequestGate {
    entered: AtomicUsize,
    entered_notify: Notify,
    released: AtomicBool,
    release_notify: Notify,
}

impl RequestGate {
    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.entered_notify.notify_waiters();
        loop {
            let released = self.release_notify.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    /// Wait until `count` requests are parked at the gate.
    pub async fn wait_entered(&self, count: usize) {
        loop {
            let entered = self.entered_notify.notified();
            if self.entered.load(Ordering::SeqCst) >= count {
                return;
            }
            entered.await;
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Let every held and future request through.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release_notify.notify_waiters();
    }
}

// ============================================================================
// IN-MEMORY REMOTE MAP
// ============================================================================

struct Subscriber<K> {
    kind: ListenerKind,
    listener: InvalidationListener<K>,
}

/// A single-member "cluster" holding one map in memory.
///
/// Every mutation pushes an invalidation to subscribers, stamped with the
/// owning partition's generation and next sequence. It also serves as the
/// authoritative [`InvalidationMetadataSource`] for that map.
pub struct InMemoryRemoteMap<K, V> {
    name: String,
    version: ServerVersion,
    partitions: HashPartitionService,
    entries: Mutex<HashMap<K, V>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber<K>>>,
    partition_state: Mutex<HashMap<PartitionId, (GenerationId, Sequence)>>,
    gate: Mutex<Option<Arc<RequestGate>>>,
    next_failure: Mutex<Option<RemoteError>>,
    unsubscribe_failure: Mutex<Option<RemoteError>>,
    events_to_drop: AtomicUsize,
    get_calls: AtomicUsize,
}

impl<K: CacheKey, V: CacheValue> InMemoryRemoteMap<K, V> {
    /// A map on a 3.12 cluster with the given partition count.
    pub fn new(name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            name: name.into(),
            version: ServerVersion::new(3, 12, 0),
            partitions: HashPartitionService::new(partition_count.max(1))
                .unwrap_or_default(),
            entries: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            partition_state: Mutex::new(HashMap::new()),
            gate: Mutex::new(None),
            next_failure: Mutex::new(None),
            unsubscribe_failure: Mutex::new(None),
            events_to_drop: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    pub fn partition_service(&self) -> Arc<dyn PartitionService> {
        Arc::new(self.partitions.clone())
    }

    /// Write directly, bypassing invalidation.
    pub fn seed(&self, key: K, value: V) {
        lock(&self.entries).insert(key, value);
    }

    pub fn value(&self, key: &K) -> Option<V> {
        lock(&self.entries).get(key).cloned()
    }

    /// Remote `get`/`get_all` calls served so far.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Hold subsequent reads until the returned gate is released.
    pub fn hold_reads(&self) -> Arc<RequestGate> {
        let gate = Arc::new(RequestGate::default());
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Fail the next read with `error`.
    pub fn fail_next_read(&self, error: RemoteError) {
        *lock(&self.next_failure) = Some(error);
    }

    /// Fail the next unsubscribe with `error`, keeping the subscription.
    pub fn fail_next_unsubscribe(&self, error: RemoteError) {
        *lock(&self.unsubscribe_failure) = Some(error);
    }

    /// Silently lose the next `count` invalidation events.
    pub fn drop_next_events(&self, count: usize) {
        self.events_to_drop.store(count, Ordering::SeqCst);
    }

    /// Simulate an ownership change: new generation, sequence restarts.
    pub fn migrate_partition(&self, partition_id: PartitionId) -> GenerationId {
        let generation = Uuid::now_v7();
        lock(&self.partition_state).insert(partition_id, (generation, 0));
        generation
    }

    /// Partition owning `key`. Unserializable keys land in partition 0.
    pub fn partition_of(&self, key: &K) -> PartitionId {
        partition_of(&self.partitions, key).unwrap_or_default()
    }

    /// Deliver `event` to every subscriber as-is.
    pub fn push(&self, event: InvalidationEvent<K>) {
        let listeners: Vec<_> = lock(&self.subscribers)
            .values()
            .map(|s| Arc::clone(&s.listener))
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Push a change notification for `key`, or for the whole map with `None`.
    pub fn invalidate(&self, key: Option<&K>) {
        let partition_id = match key {
            Some(key) => self.partition_of(key),
            None => partition_of(&self.partitions, self.name.as_str()).unwrap_or_default(),
        };
        let (generation_id, sequence) = {
            let mut state = lock(&self.partition_state);
            let entry = state
                .entry(partition_id)
                .or_insert_with(|| (Uuid::now_v7(), 0));
            entry.1 += 1;
            *entry
        };

        let dropped = self
            .events_to_drop
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return;
        }

        let subscribers: Vec<_> = lock(&self.subscribers)
            .values()
            .map(|s| (s.kind, Arc::clone(&s.listener)))
            .collect();
        for (kind, listener) in subscribers {
            let event = match kind {
                ListenerKind::Sequenced => InvalidationEvent::Single {
                    key: key.cloned(),
                    generation_id,
                    sequence,
                },
                ListenerKind::Legacy => InvalidationEvent::LegacySingle { key: key.cloned() },
            };
            listener(event);
        }
    }

    /// Deliver a read response, honouring the gate and injected failures.
    ///
    /// The response is computed before the gate, like a reply delayed on the
    /// wire.
    async fn respond<T>(&self, response: T) -> RemoteResult<T> {
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match lock(&self.next_failure).take() {
            Some(error) => Err(error),
            None => Ok(response),
        }
    }

    fn write(&self, key: K, value: V) -> Option<V> {
        let previous = lock(&self.entries).insert(key.clone(), value);
        self.invalidate(Some(&key));
        previous
    }

    fn take(&self, key: &K) -> Option<V> {
        let previous = lock(&self.entries).remove(key);
        if previous.is_some() {
            self.invalidate(Some(key));
        }
        previous
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue + PartialEq> RemoteMapService<K, V> for InMemoryRemoteMap<K, V> {
    fn map_name(&self) -> &str {
        &self.name
    }

    fn server_version(&self) -> ServerVersion {
        self.version
    }

    async fn get(&self, key: &K) -> RemoteResult<Option<V>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let value = self.value(key);
        self.respond(value).await
    }

    async fn get_all(&self, keys: &[K]) -> RemoteResult<Vec<(K, V)>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let found: Vec<(K, V)> = {
            let entries = lock(&self.entries);
            keys.iter()
                .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        };
        self.respond(found).await
    }

    async fn contains_key(&self, key: &K) -> RemoteResult<bool> {
        Ok(lock(&self.entries).contains_key(key))
    }

    async fn put(&self, key: K, value: V, _ttl: Option<Duration>) -> RemoteResult<Option<V>> {
        Ok(self.write(key, value))
    }

    async fn set(&self, key: K, value: V, _ttl: Option<Duration>) -> RemoteResult<()> {
        self.write(key, value);
        Ok(())
    }

    async fn put_transient(&self, key: K, value: V, _ttl: Option<Duration>) -> RemoteResult<()> {
        self.write(key, value);
        Ok(())
    }

    async fn put_if_absent(&self, key: K, value: V, _ttl: Option<Duration>) -> RemoteResult<Option<V>> {
        if let Some(existing) = self.value(&key) {
            return Ok(Some(existing));
        }
        self.write(key, value);
        Ok(None)
    }

    async fn put_all(&self, entries: Vec<(K, V)>) -> RemoteResult<()> {
        for (key, value) in entries {
            self.write(key, value);
        }
        Ok(())
    }

    async fn try_put(&self, key: K, value: V, _timeout: Duration) -> RemoteResult<bool> {
        self.write(key, value);
        Ok(true)
    }

    async fn replace(&self, key: K, value: V) -> RemoteResult<Option<V>> {
        if self.value(&key).is_none() {
            return Ok(None);
        }
        Ok(self.write(key, value))
    }

    async fn replace_if_same(&self, key: K, old_value: V, new_value: V) -> RemoteResult<bool> {
        if self.value(&key).as_ref() != Some(&old_value) {
            return Ok(false);
        }
        self.write(key, new_value);
        Ok(true)
    }

    async fn remove(&self, key: &K) -> RemoteResult<Option<V>> {
        Ok(self.take(key))
    }

    async fn remove_if_same(&self, key: &K, value: V) -> RemoteResult<bool> {
        if self.value(key).as_ref() != Some(&value) {
            return Ok(false);
        }
        Ok(self.take(key).is_some())
    }

    async fn delete(&self, key: &K) -> RemoteResult<()> {
        self.take(key);
        Ok(())
    }

    async fn try_remove(&self, key: &K, _timeout: Duration) -> RemoteResult<bool> {
        Ok(self.take(key).is_some())
    }

    async fn evict(&self, key: &K) -> RemoteResult<bool> {
        Ok(self.take(key).is_some())
    }

    async fn evict_all(&self) -> RemoteResult<()> {
        lock(&self.entries).clear();
        self.invalidate(None);
        Ok(())
    }

    async fn clear(&self) -> RemoteResult<()> {
        lock(&self.entries).clear();
        self.invalidate(None);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
        listener: InvalidationListener<K>,
    ) -> RemoteResult<SubscriptionId> {
        if topic.map_name != self.name {
            return Err(RemoteError::Routing {
                reason: format!("no map named {}", topic.map_name),
            });
        }
        let id = Uuid::now_v7();
        lock(&self.subscribers).insert(
            id,
            Subscriber {
                kind: topic.kind,
                listener,
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> RemoteResult<bool> {
        if let Some(error) = lock(&self.unsubscribe_failure).take() {
            return Err(error);
        }
        Ok(lock(&self.subscribers).remove(&id).is_some())
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> InvalidationMetadataSource for InMemoryRemoteMap<K, V> {
    async fn fetch_metadata(&self, map_names: &[String]) -> RemoteResult<Vec<MapInvalidationMetadata>> {
        if !map_names.contains(&self.name) {
            return Ok(Vec::new());
        }
        let mut state = lock(&self.partition_state);
        let partitions = (0..self.partitions.partition_count())
            .map(|partition_id| {
                let (generation_id, sequence) = *state
                    .entry(partition_id)
                    .or_insert_with(|| (Uuid::now_v7(), 0));
                PartitionMetadataSnapshot {
                    partition_id,
                    generation_id,
                    sequence,
                }
            })
            .collect();
        Ok(vec![MapInvalidationMetadata {
            map_name: self.name.clone(),
            partitions,
        }])
    }
}

// ============================================================================
// STATIC METADATA SOURCE
// ============================================================================

/// Metadata source returning whatever was last stored in it.
#[derive(Debug, Default)]
pub struct StaticMetadataSource {
    metadata: Mutex<Vec<MapInvalidationMetadata>>,
    failing: AtomicBool,
}

impl StaticMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, metadata: Vec<MapInvalidationMetadata>) {
        *lock(&self.metadata) = metadata;
    }

    /// Make every fetch fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvalidationMetadataSource for StaticMetadataSource {
    async fn fetch_metadata(&self, map_names: &[String]) -> RemoteResult<Vec<MapInvalidationMetadata>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::failed("fetch_metadata", "source set to fail"));
        }
        Ok(lock(&self.metadata)
            .iter()
            .filter(|m| map_names.contains(&m.map_name))
            .cloned()
            .collect())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_eviction_policy() -> impl Strategy<Value = EvictionPolicy> {
        prop_oneof![
            Just(EvictionPolicy::Lru),
            Just(EvictionPolicy::Lfu),
            Just(EvictionPolicy::Random),
            Just(EvictionPolicy::None),
        ]
    }

    pub fn arb_bounded_eviction_policy() -> impl Strategy<Value = EvictionPolicy> {
        prop_oneof![
            Just(EvictionPolicy::Lru),
            Just(EvictionPolicy::Lfu),
            Just(EvictionPolicy::Random),
        ]
    }

    pub fn arb_in_memory_format() -> impl Strategy<Value = InMemoryFormat> {
        prop_oneof![Just(InMemoryFormat::Object), Just(InMemoryFormat::Binary)]
    }

    /// Configs that pass validation.
    pub fn arb_valid_config() -> impl Strategy<Value = NearCacheConfig> {
        (
            "[a-z][a-z0-9-]{0,15}",
            1usize..1000,
            arb_eviction_policy(),
            0u64..3600,
            0u64..3600,
            any::<bool>(),
            arb_in_memory_format(),
            1usize..16,
            1usize..32,
        )
            .prop_map(|(name, max_entries, policy, ttl, idle, invalidate, format, sampling, pool)| {
                NearCacheConfig::new(name)
                    .with_max_entries(max_entries)
                    .with_eviction_policy(policy)
                    .with_eviction_sampling_count(sampling)
                    .with_eviction_sampling_pool_size(pool)
                    .with_time_to_live_seconds(ttl)
                    .with_max_idle_seconds(idle)
                    .with_invalidate_on_change(invalidate)
                    .with_in_memory_format(format)
            })
    }

    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z]{1,8}"
    }

    pub fn arb_server_version() -> impl Strategy<Value = ServerVersion> {
        (3u16..5, 0u16..13, 0u16..10).prop_map(|(major, minor, patch)| ServerVersion::new(major, minor, patch))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub const TEST_PARTITION_COUNT: u32 = 16;

    /// Scheduler with reconciliation disabled, for tests that drive cycles
    /// by hand.
    pub fn manual_scheduler(source: Arc<dyn InvalidationMetadataSource>) -> Arc<ReconciliationScheduler> {
        let config = ReconciliationConfig::with_interval_seconds(0);
        match ReconciliationScheduler::new(config, source) {
            Ok(scheduler) => Arc::new(scheduler),
            Err(e) => panic!("interval 0 is always valid: {}", e),
        }
    }

    /// Client over `remote`, reconciled against `remote` itself.
    pub async fn connect(
        config: NearCacheConfig,
        remote: Arc<InMemoryRemoteMap<String, String>>,
    ) -> NearCacheResult<(CachedMapClient<String, String>, Arc<ReconciliationScheduler>)> {
        let scheduler = manual_scheduler(remote.clone());
        let partitions = remote.partition_service();
        let client = CachedMapClient::connect(config, remote, partitions, Arc::clone(&scheduler)).await?;
        Ok((client, scheduler))
    }

    pub fn remote_map(name: &str) -> Arc<InMemoryRemoteMap<String, String>> {
        Arc::new(InMemoryRemoteMap::new(name, TEST_PARTITION_COUNT))
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
