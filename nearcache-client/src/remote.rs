//! The remote map collaborator and the invalidation events it pushes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nearcache_core::{GenerationId, RemoteResult, Sequence, ServerVersion};
use nearcache_store::{CacheKey, CacheValue};
use uuid::Uuid;

/// Identifies a registered invalidation listener.
pub type SubscriptionId = Uuid;

/// Which invalidation stream a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Keys only, no ordering metadata.
    Legacy,
    /// Keys stamped with partition generation and sequence.
    Sequenced,
}

/// Subscription target for invalidation events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTopic {
    pub map_name: String,
    pub kind: ListenerKind,
}

impl SubscriptionTopic {
    pub fn new(map_name: impl Into<String>, kind: ListenerKind) -> Self {
        Self {
            map_name: map_name.into(),
            kind,
        }
    }
}

/// Invalidation payloads pushed by the cluster.
///
/// A `None` key means every entry of the map changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent<K> {
    Single {
        key: Option<K>,
        generation_id: GenerationId,
        sequence: Sequence,
    },
    Batch {
        keys: Vec<K>,
        generation_ids: Vec<GenerationId>,
        sequences: Vec<Sequence>,
    },
    LegacySingle {
        key: Option<K>,
    },
    LegacyBatch {
        keys: Vec<K>,
    },
}

/// Callback receiving pushed events.
pub type InvalidationListener<K> = Arc<dyn Fn(InvalidationEvent<K>) + Send + Sync>;

/// Remote map operations the near cache wraps.
///
/// Every call is a network round trip. Implementations report failures as
/// [`RemoteError`](nearcache_core::RemoteError); the near cache never retries.
#[async_trait]
pub trait RemoteMapService<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Name of the remote map.
    fn map_name(&self) -> &str;

    /// Version of the cluster this service talks to.
    fn server_version(&self) -> ServerVersion;

    async fn get(&self, key: &K) -> RemoteResult<Option<V>>;

    /// Entries present remotely for `keys`. Absent keys are left out.
    async fn get_all(&self, keys: &[K]) -> RemoteResult<Vec<(K, V)>>;

    async fn contains_key(&self, key: &K) -> RemoteResult<bool>;

    /// Returns the previous value.
    async fn put(&self, key: K, value: V, ttl: Option<Duration>) -> RemoteResult<Option<V>>;

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> RemoteResult<()>;

    async fn put_transient(&self, key: K, value: V, ttl: Option<Duration>) -> RemoteResult<()>;

    /// Returns the existing value if there was one, in which case nothing
    /// was written.
    async fn put_if_absent(&self, key: K, value: V, ttl: Option<Duration>) -> RemoteResult<Option<V>>;

    async fn put_all(&self, entries: Vec<(K, V)>) -> RemoteResult<()>;

    /// Returns whether the lock was acquired and the value written.
    async fn try_put(&self, key: K, value: V, timeout: Duration) -> RemoteResult<bool>;

    async fn replace(&self, key: K, value: V) -> RemoteResult<Option<V>>;

    async fn replace_if_same(&self, key: K, old_value: V, new_value: V) -> RemoteResult<bool>;

    async fn remove(&self, key: &K) -> RemoteResult<Option<V>>;

    async fn remove_if_same(&self, key: &K, value: V) -> RemoteResult<bool>;

    async fn delete(&self, key: &K) -> RemoteResult<()>;

    async fn try_remove(&self, key: &K, timeout: Duration) -> RemoteResult<bool>;

    async fn evict(&self, key: &K) -> RemoteResult<bool>;

    async fn evict_all(&self) -> RemoteResult<()>;

    async fn clear(&self) -> RemoteResult<()>;

    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
        listener: InvalidationListener<K>,
    ) -> RemoteResult<SubscriptionId>;

    /// Returns whether the subscription existed.
    async fn unsubscribe(&self, id: SubscriptionId) -> RemoteResult<bool>;
}
