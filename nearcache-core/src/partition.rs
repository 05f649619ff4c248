//! Partition routing.
//!
//! Maintaining the partition table is the cluster's job. The near cache only
//! needs two things from it: how many partitions exist, and which partition
//! owns a key. Ownership is decided on the key's serialized bytes, the same
//! form the cluster hashes, so a real partition table can answer it.

use crate::error::{ConfigError, NearCacheError, NearCacheResult};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Partition identifier.
pub type PartitionId = u32;

/// Partition count used when the cluster does not say otherwise.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Stable in-process hash of a key.
///
/// Only used for local bookkeeping such as marker slots. Never for routing:
/// `DefaultHasher` output means nothing to the cluster.
pub fn key_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Serialized form of a key, the bytes partitions are routed by.
pub fn key_bytes<K: Serialize + ?Sized>(key: &K) -> NearCacheResult<Vec<u8>> {
    serde_json::to_vec(key).map_err(|e| NearCacheError::KeySerialization(e.to_string()))
}

/// Partition owning `key` according to `partitions`.
pub fn partition_of<K: Serialize + ?Sized>(
    partitions: &dyn PartitionService,
    key: &K,
) -> NearCacheResult<PartitionId> {
    Ok(partitions.partition_id(&key_bytes(key)?))
}

/// Read-only view of the cluster's partition table.
pub trait PartitionService: Send + Sync {
    /// Number of partitions in the cluster.
    fn partition_count(&self) -> u32;

    /// Partition owning the key whose serialized form is `key`.
    fn partition_id(&self, key: &[u8]) -> PartitionId;
}

/// Partition service with a fixed partition count, routing by a hash of the
/// serialized key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartitionService {
    partition_count: u32,
}

impl HashPartitionService {
    /// Create a partition service, rejecting a zero partition count.
    pub fn new(partition_count: u32) -> NearCacheResult<Self> {
        if partition_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "partition_count".to_string(),
                value: partition_count.to_string(),
                reason: "partition_count must be greater than 0".to_string(),
            }
            .into());
        }
        Ok(Self { partition_count })
    }
}

impl Default for HashPartitionService {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

impl PartitionService for HashPartitionService {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn partition_id(&self, key: &[u8]) -> PartitionId {
        (key_hash(key) % u64::from(self.partition_count)) as PartitionId
    }
}
