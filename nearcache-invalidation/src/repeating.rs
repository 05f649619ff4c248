//! Cancellable fixed-rate background task.
//!
//! The task sleeps for an initial delay, then runs its body once per period
//! until cancelled or dropped. Ticks missed while a run is still in progress
//! are skipped rather than replayed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a periodically running body.
#[derive(Debug)]
pub struct RepeatingTask {
    period: Duration,
    cancelled: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawn `body` to run every `period` after `initial_delay`.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn schedule<F, Fut>(initial_delay: Duration, period: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let start = Instant::now() + initial_delay;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        body().await;
                    }
                }
            }
            tracing::trace!("Repeating task stopped");
        });

        Self {
            period,
            cancelled: AtomicBool::new(false),
            shutdown_tx,
            handle,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop future runs. A run already in progress finishes.
    ///
    /// Returns `false` if the task was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the spawned loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
