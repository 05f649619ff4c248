//! Where authoritative invalidation metadata comes from.

use async_trait::async_trait;
use nearcache_core::RemoteResult;

use crate::metadata::MapInvalidationMetadata;

/// Fetches per-partition generation ids and sequences from the cluster.
#[async_trait]
pub trait InvalidationMetadataSource: Send + Sync {
    /// Metadata for each named map. Maps the cluster does not know are
    /// omitted from the result.
    async fn fetch_metadata(&self, map_names: &[String]) -> RemoteResult<Vec<MapInvalidationMetadata>>;
}
