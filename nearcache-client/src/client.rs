//! Map client fronted by a near cache.
//!
//! Reads are served locally when possible. A read miss marks its key before
//! the remote call and only publishes the result if no invalidation for that
//! key arrived in between. Writes go to the cluster first and then drop the
//! local copy; the cluster's own invalidation event follows later.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nearcache_core::{NearCacheConfig, NearCacheResult, PartitionService};
use nearcache_invalidation::{InvalidationTracker, ReconciliationScheduler, RegistrationId};
use nearcache_store::{CacheKey, CacheLookup, CacheStatistics, CacheValue, GuardedCacheStore};

use crate::handler::{InvalidationHandler, LegacyInvalidationHandler, SequenceAwareInvalidationHandler};
use crate::remote::{
    InvalidationEvent, InvalidationListener, ListenerKind, RemoteMapService, SubscriptionId,
    SubscriptionTopic,
};

/// Marks owned by one read, released on every exit path.
///
/// Dropping the guard force-unmarks whatever was not published, so a failed
/// or cancelled remote call never leaves a slot stuck.
struct PopulateGuard<'a, K: CacheKey, V: CacheValue> {
    store: &'a GuardedCacheStore<K, V>,
    owned: HashSet<K>,
}

impl<'a, K: CacheKey, V: CacheValue> PopulateGuard<'a, K, V> {
    fn new(store: &'a GuardedCacheStore<K, V>) -> Self {
        Self {
            store,
            owned: HashSet::new(),
        }
    }

    fn mark(&mut self, key: &K) -> bool {
        if self.owned.contains(key) || !self.store.try_mark(key) {
            return false;
        }
        self.owned.insert(key.clone());
        true
    }

    /// Publish `value` if this guard still owns the key's mark.
    fn publish(&mut self, key: K, value: Option<V>) -> bool {
        if !self.owned.remove(&key) {
            return false;
        }
        self.store.publish_marked(key, value)
    }
}

impl<K: CacheKey, V: CacheValue> Drop for PopulateGuard<'_, K, V> {
    fn drop(&mut self) {
        for key in self.owned.drain() {
            self.store.release_mark(&key);
        }
    }
}

struct NearCache<K, V> {
    store: Arc<GuardedCacheStore<K, V>>,
    listener: Option<ListenerKind>,
    registration: Mutex<Option<RegistrationId>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one remote map with a near cache in front of it.
pub struct CachedMapClient<K, V> {
    name: String,
    remote: Arc<dyn RemoteMapService<K, V>>,
    scheduler: Arc<ReconciliationScheduler>,
    near: Option<NearCache<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CachedMapClient<K, V> {
    /// Build the near cache for `remote` and subscribe to invalidations.
    ///
    /// Clusters at 3.8 or later get sequence-aware handling and a tracker
    /// registered with `scheduler`; older clusters get the legacy handler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid `config`, or the remote
    /// error if the invalidation subscription fails.
    pub async fn connect(
        config: NearCacheConfig,
        remote: Arc<dyn RemoteMapService<K, V>>,
        partitions: Arc<dyn PartitionService>,
        scheduler: Arc<ReconciliationScheduler>,
    ) -> NearCacheResult<Self> {
        config.validate()?;
        let name = remote.map_name().to_string();

        if !config.enabled {
            tracing::debug!(map = %name, "Near cache disabled, reads go to the cluster");
            return Ok(Self {
                name,
                remote,
                scheduler,
                near: None,
            });
        }

        let store = Arc::new(GuardedCacheStore::from_config(
            &config,
            partitions.partition_count() as usize,
        )?);

        let mut near = NearCache {
            store: Arc::clone(&store),
            listener: None,
            registration: Mutex::new(None),
            subscription: Mutex::new(None),
        };

        if config.invalidate_on_change {
            let version = remote.server_version();
            let tracker = version.supports_sequenced_invalidation().then(|| {
                Arc::new(InvalidationTracker::new(Arc::clone(&store), partitions, scheduler.config()))
            });
            let handler: Arc<dyn InvalidationHandler<K>> = match &tracker {
                Some(tracker) => Arc::new(SequenceAwareInvalidationHandler::new(Arc::clone(tracker))),
                None => Arc::new(LegacyInvalidationHandler::new(Arc::clone(&store))),
            };

            let kind = handler.kind();
            let listener: InvalidationListener<K> =
                Arc::new(move |event: InvalidationEvent<K>| handler.handle(event));
            let id = remote
                .subscribe(SubscriptionTopic::new(name.clone(), kind), listener)
                .await?;
            *near.subscription.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(id);
            near.listener = Some(kind);

            if let Some(tracker) = tracker {
                let id = scheduler.register(tracker).await;
                *near.registration.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(id);
            }

            tracing::info!(
                map = %name,
                %version,
                listener = ?kind,
                "Near cache invalidation listener registered"
            );
        }

        Ok(Self {
            name,
            remote,
            scheduler,
            near: Some(near),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invalidation stream in use, `None` without invalidate-on-change.
    pub fn listener_kind(&self) -> Option<ListenerKind> {
        self.near.as_ref().and_then(|near| near.listener)
    }

    /// Near cache counters, `None` when the near cache is disabled.
    pub fn statistics(&self) -> Option<CacheStatistics> {
        self.near.as_ref().map(|near| near.store.statistics())
    }

    /// The guarded store backing the near cache.
    pub fn near_cache(&self) -> Option<&Arc<GuardedCacheStore<K, V>>> {
        self.near.as_ref().map(|near| &near.store)
    }

    fn invalidate(&self, key: &K) {
        if let Some(near) = &self.near {
            near.store.invalidate(key);
        }
    }

    fn clear_near_cache(&self) {
        if let Some(near) = &self.near {
            near.store.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn get(&self, key: &K) -> NearCacheResult<Option<V>> {
        let Some(near) = &self.near else {
            return Ok(self.remote.get(key).await?);
        };
        if let CacheLookup::Hit(value) = near.store.get(key) {
            return Ok(value);
        }

        let mut guard = PopulateGuard::new(&near.store);
        guard.mark(key);
        match self.remote.get(key).await {
            Ok(value) => {
                guard.publish(key.clone(), value.clone());
                Ok(value)
            }
            Err(e) => {
                drop(guard);
                // An invalidation may have been lost while the key was marked.
                near.store.invalidate(key);
                Err(e.into())
            }
        }
    }

    /// Values for `keys`, cached ones first. Keys without a value are absent
    /// from the result.
    pub async fn get_all(&self, keys: &[K]) -> NearCacheResult<HashMap<K, V>> {
        let Some(near) = &self.near else {
            return Ok(self.remote.get_all(keys).await?.into_iter().collect());
        };

        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match near.store.get(key) {
                CacheLookup::Hit(Some(value)) => {
                    found.insert(key.clone(), value);
                }
                CacheLookup::Hit(None) => {}
                CacheLookup::Miss => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let mut guard = PopulateGuard::new(&near.store);
        for key in &missing {
            guard.mark(key);
        }
        for (key, value) in self.remote.get_all(&missing).await? {
            guard.publish(key.clone(), Some(value.clone()));
            found.insert(key, value);
        }
        Ok(found)
    }

    /// Answered locally when the key is cached, otherwise by the cluster.
    pub async fn contains_key(&self, key: &K) -> NearCacheResult<bool> {
        if let Some(near) = &self.near {
            if let CacheLookup::Hit(value) = near.store.get(key) {
                return Ok(value.is_some());
            }
        }
        Ok(self.remote.contains_key(key).await?)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn put(&self, key: K, value: V, ttl: Option<Duration>) -> NearCacheResult<Option<V>> {
        let previous = self.remote.put(key.clone(), value, ttl).await?;
        self.invalidate(&key);
        Ok(previous)
    }

    pub async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> NearCacheResult<()> {
        self.remote.set(key.clone(), value, ttl).await?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn put_transient(&self, key: K, value: V, ttl: Option<Duration>) -> NearCacheResult<()> {
        self.remote.put_transient(key.clone(), value, ttl).await?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn put_if_absent(&self, key: K, value: V, ttl: Option<Duration>) -> NearCacheResult<Option<V>> {
        let existing = self.remote.put_if_absent(key.clone(), value, ttl).await?;
        self.invalidate(&key);
        Ok(existing)
    }

    pub async fn put_all(&self, entries: Vec<(K, V)>) -> NearCacheResult<()> {
        let keys: Vec<K> = entries.iter().map(|(key, _)| key.clone()).collect();
        self.remote.put_all(entries).await?;
        for key in &keys {
            self.invalidate(key);
        }
        Ok(())
    }

    pub async fn try_put(&self, key: K, value: V, timeout: Duration) -> NearCacheResult<bool> {
        let written = self.remote.try_put(key.clone(), value, timeout).await?;
        self.invalidate(&key);
        Ok(written)
    }

    pub async fn replace(&self, key: K, value: V) -> NearCacheResult<Option<V>> {
        let previous = self.remote.replace(key.clone(), value).await?;
        self.invalidate(&key);
        Ok(previous)
    }

    pub async fn replace_if_same(&self, key: K, old_value: V, new_value: V) -> NearCacheResult<bool> {
        let replaced = self
            .remote
            .replace_if_same(key.clone(), old_value, new_value)
            .await?;
        self.invalidate(&key);
        Ok(replaced)
    }

    pub async fn remove(&self, key: &K) -> NearCacheResult<Option<V>> {
        let previous = self.remote.remove(key).await?;
        self.invalidate(key);
        Ok(previous)
    }

    pub async fn remove_if_same(&self, key: &K, value: V) -> NearCacheResult<bool> {
        let removed = self.remote.remove_if_same(key, value).await?;
        self.invalidate(key);
        Ok(removed)
    }

    pub async fn delete(&self, key: &K) -> NearCacheResult<()> {
        self.remote.delete(key).await?;
        self.invalidate(key);
        Ok(())
    }

    pub async fn try_remove(&self, key: &K, timeout: Duration) -> NearCacheResult<bool> {
        let removed = self.remote.try_remove(key, timeout).await?;
        self.invalidate(key);
        Ok(removed)
    }

    pub async fn evict(&self, key: &K) -> NearCacheResult<bool> {
        let evicted = self.remote.evict(key).await?;
        self.invalidate(key);
        Ok(evicted)
    }

    pub async fn evict_all(&self) -> NearCacheResult<()> {
        self.remote.evict_all().await?;
        self.clear_near_cache();
        Ok(())
    }

    pub async fn clear(&self) -> NearCacheResult<()> {
        self.remote.clear().await?;
        self.clear_near_cache();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Detach from the cluster's invalidation stream and drop local state.
    ///
    /// The remote map itself is left untouched. Local teardown happens even
    /// when unsubscribing fails; the listener is then kept on record so a
    /// later call retries it.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the listener could not be removed.
    pub async fn destroy(&self) -> NearCacheResult<()> {
        let Some(near) = &self.near else {
            return Ok(());
        };

        let registration = lock(&near.registration).take();
        if let Some(id) = registration {
            self.scheduler.deregister(id);
        }
        near.store.clear();

        let subscription = lock(&near.subscription).take();
        if let Some(id) = subscription {
            match self.remote.unsubscribe(id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(map = %self.name, subscription = %id, "Invalidation listener already gone");
                }
                Err(e) => {
                    *lock(&near.subscription) = Some(id);
                    tracing::warn!(
                        map = %self.name,
                        subscription = %id,
                        error = %e,
                        "Failed to remove invalidation listener"
                    );
                    return Err(e.into());
                }
            }
        }

        tracing::info!(map = %self.name, "Near cache destroyed");
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for CachedMapClient<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedMapClient")
            .field("name", &self.name)
            .field("near_cache", &self.near.is_some())
            .finish_non_exhaustive()
    }
}
