//! Per-partition invalidation metadata.
//!
//! The cluster stamps every invalidation with the partition's generation id
//! and a sequence number that grows by one per invalidation. Comparing the
//! last sequence seen against the next one tells the client whether it lost
//! events in between.

use chrono::{DateTime, Utc};
use nearcache_core::{GenerationId, PartitionId, Sequence};

/// What the client knows about one partition's invalidation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInvalidationMetadata {
    /// Ownership epoch the sequence belongs to.
    pub generation_id: GenerationId,
    /// Highest sequence applied so far.
    pub last_sequence: Sequence,
    /// Invalidations detected as lost since the last reset.
    pub miss_count: u64,
    /// When this partition was last (re)initialized.
    pub observed_at: DateTime<Utc>,
}

/// Result of feeding a sequence number into the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the next sequence.
    InOrder,
    /// Sequence jumped ahead; `missed` events were never delivered.
    Gap { missed: u64 },
    /// Sequence at or below the last one, a duplicate or late delivery.
    Stale,
}

impl PartitionInvalidationMetadata {
    /// Start tracking at the given generation and sequence.
    pub fn new(generation_id: GenerationId, sequence: Sequence) -> Self {
        Self {
            generation_id,
            last_sequence: sequence,
            miss_count: 0,
            observed_at: Utc::now(),
        }
    }

    /// Advance to `sequence`, recording any gap as missed invalidations.
    pub fn advance(&mut self, sequence: Sequence) -> SequenceCheck {
        if sequence <= self.last_sequence {
            return SequenceCheck::Stale;
        }
        let missed = sequence.abs_diff(self.last_sequence) - 1;
        self.last_sequence = sequence;
        if missed == 0 {
            SequenceCheck::InOrder
        } else {
            self.miss_count = self.miss_count.saturating_add(missed);
            SequenceCheck::Gap { missed }
        }
    }

    /// Time since this partition was last (re)initialized.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.observed_at)
    }

    /// How far this partition trails an authoritative sequence.
    pub fn lag_behind(&self, authoritative: Sequence) -> u64 {
        if authoritative > self.last_sequence {
            authoritative.abs_diff(self.last_sequence)
        } else {
            0
        }
    }
}

/// Authoritative metadata for one partition, as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetadataSnapshot {
    pub partition_id: PartitionId,
    pub generation_id: GenerationId,
    pub sequence: Sequence,
}

/// Authoritative metadata for every partition of one map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInvalidationMetadata {
    pub map_name: String,
    pub partitions: Vec<PartitionMetadataSnapshot>,
}
