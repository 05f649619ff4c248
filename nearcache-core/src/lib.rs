//! Near Cache Core - Shared Types
//!
//! Errors, configuration, partition routing and protocol versions used by
//! every other crate in the workspace. No caching logic lives here.

pub mod config;
pub mod error;
pub mod partition;
pub mod version;

pub use config::{
    EvictionPolicy, InMemoryFormat, NearCacheConfig, ReconciliationConfig,
    DEFAULT_EVICTION_SAMPLING_COUNT, DEFAULT_EVICTION_SAMPLING_POOL_SIZE,
    DEFAULT_MAX_TOLERATED_MISS_COUNT, DEFAULT_RECONCILIATION_INTERVAL_SECONDS,
    MIN_RECONCILIATION_INTERVAL_SECONDS,
};
pub use error::{ConfigError, NearCacheError, NearCacheResult, RemoteError, RemoteResult};
pub use partition::{
    key_bytes, key_hash, partition_of, HashPartitionService, PartitionId, PartitionService,
    DEFAULT_PARTITION_COUNT,
};
pub use version::{ServerVersion, VersionParseError};

use uuid::Uuid;

/// Identifies one ownership epoch of a partition.
///
/// Changes whenever the partition migrates to a new owner, invalidating the
/// sequence lineage the client tracked for it.
pub type GenerationId = Uuid;

/// Per-partition invalidation sequence number.
pub type Sequence = i64;
