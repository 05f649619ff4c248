//! Periodic anti-entropy for every registered tracker.
//!
//! Push invalidations can be lost in transit. Once per reconciliation
//! interval the scheduler fetches authoritative partition metadata for every
//! registered map and lets each tracker repair whatever drifted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use nearcache_core::{NearCacheResult, ReconciliationConfig};
use uuid::Uuid;

use crate::metadata::MapInvalidationMetadata;
use crate::repeating::RepeatingTask;
use crate::source::InvalidationMetadataSource;
use crate::tracker::Reconcilable;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for reconciliation activity.
#[derive(Debug, Default)]
pub struct ReconciliationMetrics {
    /// Completed reconciliation cycles
    pub cycles: AtomicU64,

    /// Partitions cleared because they had drifted
    pub partitions_repaired: AtomicU64,

    /// Entries dropped by those repairs
    pub entries_removed: AtomicU64,

    /// Failed metadata fetches
    pub fetch_errors: AtomicU64,
}

impl ReconciliationMetrics {
    pub fn snapshot(&self) -> ReconciliationSnapshot {
        ReconciliationSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            partitions_repaired: self.partitions_repaired.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReconciliationMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconciliationSnapshot {
    pub cycles: u64,
    pub partitions_repaired: u64,
    pub entries_removed: u64,
    pub fetch_errors: u64,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Handle for one registered tracker.
///
/// Several near caches may front the same map, so registrations are not
/// keyed by map name.
pub type RegistrationId = Uuid;

struct Shared {
    source: Arc<dyn InvalidationMetadataSource>,
    trackers: RwLock<HashMap<RegistrationId, Arc<dyn Reconcilable>>>,
    metrics: ReconciliationMetrics,
}

impl Shared {
    fn trackers(&self) -> Vec<Arc<dyn Reconcilable>> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    async fn reconcile(&self, trackers: &[Arc<dyn Reconcilable>]) {
        if trackers.is_empty() {
            return;
        }
        let mut names: Vec<String> = trackers.iter().map(|t| t.map_name().to_string()).collect();
        names.sort();
        names.dedup();

        let metadata = match self.source.fetch_metadata(&names).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, maps = names.len(), "Failed to fetch invalidation metadata");
                self.metrics.fetch_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for map in &metadata {
            for tracker in trackers.iter().filter(|t| t.map_name() == map.map_name) {
                self.repair(tracker.as_ref(), map);
            }
        }
    }

    fn repair(&self, tracker: &dyn Reconcilable, map: &MapInvalidationMetadata) {
        let missed = tracker.missed_count();
        let outcome = tracker.reconcile(&map.partitions);
        if outcome.repaired_anything() {
            self.metrics
                .partitions_repaired
                .fetch_add(outcome.partitions_cleared as u64, Ordering::Relaxed);
            self.metrics
                .entries_removed
                .fetch_add(outcome.entries_removed as u64, Ordering::Relaxed);
            tracing::info!(
                map = %map.map_name,
                partitions = outcome.partitions_cleared,
                entries = outcome.entries_removed,
                missed_before = missed,
                "Near cache repaired from cluster metadata"
            );
        }
    }
}

/// Drives reconciliation for all near-cached maps of one client.
///
/// The repeating task starts lazily with the first registered tracker and
/// stops on [`shutdown`](Self::shutdown) or drop.
pub struct ReconciliationScheduler {
    config: ReconciliationConfig,
    period: Option<Duration>,
    shared: Arc<Shared>,
    task: Mutex<Option<RepeatingTask>>,
}

impl ReconciliationScheduler {
    /// Validate the interval and build an idle scheduler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an interval between 1 and 29
    /// seconds.
    pub fn new(
        config: ReconciliationConfig,
        source: Arc<dyn InvalidationMetadataSource>,
    ) -> NearCacheResult<Self> {
        let period = config.effective_period()?;
        Ok(Self {
            config,
            period,
            shared: Arc::new(Shared {
                source,
                trackers: RwLock::new(HashMap::new()),
                metrics: ReconciliationMetrics::default(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Thresholds trackers registered here should use.
    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Firing period, `None` when reconciliation is disabled.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    fn task(&self) -> MutexGuard<'_, Option<RepeatingTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a repeating task is currently scheduled and alive.
    pub fn is_running(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|task| !task.is_cancelled() && !task.is_finished())
    }

    pub fn metrics(&self) -> ReconciliationSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn tracker_count(&self) -> usize {
        self.shared
            .trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a tracker, seeding it with the cluster's current metadata.
    ///
    /// A failed seed fetch is logged; the tracker then initializes from the
    /// first pushed event instead. Trackers for the same map coexist.
    pub async fn register(&self, tracker: Arc<dyn Reconcilable>) -> RegistrationId {
        self.shared.reconcile(std::slice::from_ref(&tracker)).await;

        let id = Uuid::now_v7();
        tracing::debug!(
            map = %tracker.map_name(),
            registration = %id,
            "Reconciliation tracker registered"
        );
        self.shared
            .trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tracker);

        self.ensure_started();
        id
    }

    /// Stop reconciling the tracker behind `id`. Returns whether it was
    /// registered.
    pub fn deregister(&self, id: RegistrationId) -> bool {
        self.shared
            .trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: RegistrationId) -> bool {
        self.shared
            .trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Run one reconciliation cycle now.
    pub async fn run_once(&self) {
        run_cycle(&self.shared).await;
    }

    /// Cancel the repeating task. Registered trackers are kept.
    pub fn shutdown(&self) {
        if let Some(task) = self.task().take() {
            task.cancel();
            tracing::info!("Reconciliation task stopped");
        }
    }

    fn ensure_started(&self) {
        let Some(period) = self.period else {
            return;
        };
        let mut task = self.task();
        if task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(RepeatingTask::schedule(period, period, move || {
            let shared = Arc::clone(&shared);
            async move { run_cycle(&shared).await }
        }));
        tracing::info!(period_secs = period.as_secs(), "Reconciliation task started");
    }
}

async fn run_cycle(shared: &Shared) {
    let trackers = shared.trackers();
    shared.reconcile(&trackers).await;
    shared.metrics.cycles.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(trackers = trackers.len(), "Reconciliation cycle completed");
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("period", &self.period)
            .field("trackers", &self.tracker_count())
            .field("running", &self.is_running())
            .finish()
    }
}
