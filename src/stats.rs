//! In-process counters and periodic metric snapshots.
//!
//! Buffer verbs bump shared atomic counters instead of touching the
//! store; a recorder flushes the accumulated deltas together with live
//! gauges to the `statistics` table on an interval (default 10 s).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::message::now_millis;
use crate::store::Store;

/// Messages accepted by `enqueue` since the last flush.
pub const METRIC_ENQUEUED: &str = "enqueued";
/// Messages delivered since the last flush.
pub const METRIC_COMPLETED: &str = "completed";
/// Messages archived as failed since the last flush.
pub const METRIC_FAILED: &str = "failed";
/// Messages expired since the last flush.
pub const METRIC_EXPIRED: &str = "expired";
/// Retry requeues (including lease reclaims) since the last flush.
pub const METRIC_RETRIED: &str = "retried";
/// Gauge: rows currently pending.
pub const METRIC_PENDING_CURRENT: &str = "pending_current";
/// Gauge: rows currently processing.
pub const METRIC_PROCESSING_CURRENT: &str = "processing_current";
/// Gauge: completions observed over the trailing minute.
pub const METRIC_THROUGHPUT_PER_MINUTE: &str = "throughput_per_minute";

/// Shared transition counters, reset on every flush.
#[derive(Debug, Default)]
pub struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    /// Record an accepted enqueue.
    pub fn enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed delivery.
    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal failure.
    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` expirations.
    pub fn expired(&self, n: u64) {
        self.expired.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` retry requeues.
    pub fn retried(&self, n: u64) {
        self.retried.fetch_add(n, Ordering::Relaxed);
    }

    fn drain(&self) -> [(&'static str, u64); 5] {
        [
            (METRIC_ENQUEUED, self.enqueued.swap(0, Ordering::Relaxed)),
            (METRIC_COMPLETED, self.completed.swap(0, Ordering::Relaxed)),
            (METRIC_FAILED, self.failed.swap(0, Ordering::Relaxed)),
            (METRIC_EXPIRED, self.expired.swap(0, Ordering::Relaxed)),
            (METRIC_RETRIED, self.retried.swap(0, Ordering::Relaxed)),
        ]
    }
}

/// Writes counter deltas and live gauges to the `statistics` table.
pub struct StatsRecorder {
    store: Arc<Store>,
    counters: Arc<Counters>,
}

impl StatsRecorder {
    /// Create a recorder over the shared store and counter set.
    pub fn new(store: Arc<Store>, counters: Arc<Counters>) -> Self {
        Self { store, counters }
    }

    /// Flush one snapshot: drained counter deltas plus the pending /
    /// processing gauges and trailing-minute throughput.
    pub async fn flush(&self) -> Result<(), BridgeError> {
        let now = now_millis();
        let drained = self.counters.drain();
        let counts = self.store.status_counts().await?;
        let throughput = self.store.completed_since(now - 60_000).await?;

        let mut metrics: Vec<(&str, f64)> = drained
            .iter()
            .map(|(name, value)| (*name, *value as f64))
            .collect();
        metrics.push((METRIC_PENDING_CURRENT, counts.pending as f64));
        metrics.push((METRIC_PROCESSING_CURRENT, counts.processing as f64));
        metrics.push((METRIC_THROUGHPUT_PER_MINUTE, throughput as f64));

        self.store.record_metrics(now, &metrics).await?;
        debug!(pending = counts.pending, processing = counts.processing, "metrics snapshot");
        Ok(())
    }

    /// Spawn the periodic flush loop, stopping when `shutdown` flips to
    /// true.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.flush().await {
                            warn!(%error, "metric flush failed");
                        }
                    }
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
