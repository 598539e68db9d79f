//! Background eviction of idle limiter entries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::keyed::KeyedLimiterSet;
use super::registry::RegistrySettings;

/// Periodically evicts idle entries from one [`KeyedLimiterSet`].
///
/// The task is either running or stopped; once stopped it never restarts.
/// Dropping the sweeper also ends the task, at its next wake-up.
#[derive(Debug)]
pub struct Sweeper {
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    passes: Arc<AtomicU64>,
}

impl Sweeper {
    /// Start sweeping `set` on `runtime` with the given interval and idle TTL.
    ///
    /// The first pass runs one full interval after the sweeper starts.
    pub fn spawn(set: Arc<KeyedLimiterSet>, settings: &RegistrySettings, runtime: &Handle) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let passes = Arc::new(AtomicU64::new(0));
        let task_passes = Arc::clone(&passes);
        let interval = settings.sweep_interval;
        let idle_ttl = settings.idle_ttl;

        info!(
            registry_key = %set.key(),
            interval_secs = interval.as_secs_f64(),
            idle_ttl_secs = idle_ttl.as_secs_f64(),
            "Starting sweeper"
        );

        let handle = runtime.spawn(async move {
            let Some(start) = Instant::now().checked_add(interval) else {
                // No tick could ever fire; only the stop signal remains.
                warn!(registry_key = %set.key(), "Sweep interval too large, sweeper idle");
                let _ = stop_rx.changed().await;
                return;
            };
            let mut ticker = time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    // Fires on the stop signal, or with an error once the sender is gone.
                    _ = stop_rx.changed() => break,

                    _ = ticker.tick() => {
                        let removed = set.evict_idle(idle_ttl);
                        let pass = task_passes.fetch_add(1, Ordering::AcqRel) + 1;
                        debug!(
                            registry_key = %set.key(),
                            pass = pass,
                            removed = removed,
                            remaining = set.len(),
                            "Sweep pass complete"
                        );
                    }
                }
            }

            info!(registry_key = %set.key(), "Sweeper stopped");
        });

        Self {
            stop_tx,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
            passes,
        }
    }

    /// Signal the task to stop and wait until it has exited.
    ///
    /// Safe to call any number of times, concurrently or not. The signal is
    /// sent once; every caller returns only after the task has terminated,
    /// so no sweep pass runs after `stop` returns.
    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            // A send error means the task already exited.
            let _ = self.stop_tx.send(true);
        }

        let mut handle = self.handle.lock().await;
        if let Some(task) = handle.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of completed sweep passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }
}
