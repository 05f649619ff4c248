//! Near Cache Invalidation
//!
//! Applies server-pushed invalidations to a near cache and keeps it from
//! drifting when pushes are lost:
//!
//! - [`InvalidationTracker`] follows per-partition sequence numbers and
//!   clears what it can no longer vouch for.
//! - [`ReconciliationScheduler`] periodically compares that bookkeeping with
//!   the cluster's authoritative metadata.
//! - [`RepeatingTask`] is the cancellable timer underneath the scheduler.

pub mod metadata;
pub mod repeating;
pub mod scheduler;
pub mod source;
pub mod tracker;

pub use metadata::{
    MapInvalidationMetadata, PartitionInvalidationMetadata, PartitionMetadataSnapshot, SequenceCheck,
};
pub use repeating::RepeatingTask;
pub use scheduler::{
    ReconciliationMetrics, ReconciliationScheduler, ReconciliationSnapshot, RegistrationId,
};
pub use source::InvalidationMetadataSource;
pub use tracker::{InvalidationTracker, Reconcilable, ReconcileOutcome};
