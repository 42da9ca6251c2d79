//! Periodic store maintenance.
//!
//! One task runs, in order: stuck-lease reclamation, TTL expiry, the
//! retention sweep of completed rows, and a metric snapshot. Each step
//! is its own transaction, so a failure in one never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::message::now_millis;
use crate::stats::{Counters, StatsRecorder};
use crate::store::Store;

/// Tuning knobs for the janitor.
#[derive(Debug, Clone)]
pub struct JanitorOptions {
    /// Sweep interval.
    pub interval: Duration,
    /// Retention window for completed rows.
    pub retention: Duration,
}

impl Default for JanitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// The maintenance task.
pub struct Janitor {
    store: Arc<Store>,
    counters: Arc<Counters>,
    recorder: Arc<StatsRecorder>,
    options: JanitorOptions,
}

impl Janitor {
    /// Create a janitor over the shared store, counters and recorder.
    pub fn new(
        store: Arc<Store>,
        counters: Arc<Counters>,
        recorder: Arc<StatsRecorder>,
        options: JanitorOptions,
    ) -> Self {
        Self {
            store,
            counters,
            recorder,
            options,
        }
    }

    /// Run one maintenance sweep. Public so startup recovery and tests
    /// can drive it directly.
    pub async fn run_sweep(&self) {
        let now = now_millis();

        match self.store.reclaim_stuck(now).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                self.counters.retried(reclaimed);
                info!(reclaimed, "returned abandoned leases to pending");
            }
            Err(error) => warn!(%error, "stuck-lease reclamation failed"),
        }

        match self.store.expire_due(now).await {
            Ok(0) => {}
            Ok(expired) => {
                self.counters.expired(expired);
                info!(expired, "expired messages past their TTL");
            }
            Err(error) => warn!(%error, "TTL sweep failed"),
        }

        let cutoff = now - self.options.retention.as_millis() as i64;
        match self.store.cleanup(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed completed rows past retention"),
            Err(error) => warn!(%error, "retention sweep failed"),
        }

        if let Err(error) = self.recorder.flush().await {
            warn!(%error, "metric snapshot failed");
        }
    }

    /// Spawn the periodic sweep loop, stopping when `shutdown` flips to
    /// true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately, which doubles as startup
            // recovery of leases left over from a crash.
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_sweep().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
