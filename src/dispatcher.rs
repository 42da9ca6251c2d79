//! Worker pool leasing messages from the buffer and driving egress
//! adapters.
//!
//! Each worker loops: claim a batch under a lease, deliver each message
//! bounded by the per-message timeout, and report the outcome back to
//! the buffer. Claims are atomic at the store, so workers never contend
//! over the same message; egress calls run outside any store
//! transaction.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

use crate::adapter::{AdapterRegistry, Outcome};
use crate::buffer::Buffer;
use crate::message::Message;
use crate::transform;

/// Tuning knobs for the dispatcher pool.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Messages claimed per round.
    pub batch_size: u32,
    /// Lease granted on each claim; expired leases are reclaimed by the
    /// janitor.
    pub lease_duration: Duration,
    /// Upper bound on a single egress call.
    pub per_message_timeout: Duration,
    /// First-retry backoff; doubles per retry.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Idle sleep after an empty claim; doubles up to
    /// `idle_backoff_ceiling` and resets on a non-empty claim.
    pub idle_backoff_floor: Duration,
    /// Idle sleep ceiling.
    pub idle_backoff_ceiling: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 16,
            lease_duration: Duration::from_secs(60),
            per_message_timeout: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            idle_backoff_floor: Duration::from_millis(50),
            idle_backoff_ceiling: Duration::from_secs(2),
        }
    }
}

/// The worker pool. [`Dispatcher::start`] spawns one task per worker.
pub struct Dispatcher {
    buffer: Arc<Buffer>,
    adapters: Arc<AdapterRegistry>,
    options: DispatcherOptions,
}

impl Dispatcher {
    /// Create a dispatcher over the shared buffer and adapter registry.
    pub fn new(
        buffer: Arc<Buffer>,
        adapters: Arc<AdapterRegistry>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            buffer,
            adapters,
            options,
        }
    }

    /// Spawn the worker tasks. Workers stop claiming once `shutdown`
    /// flips to true, finishing the message currently in flight;
    /// leftover leases are reclaimed by the janitor.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.options.workers);
        for i in 1..=self.options.workers {
            let name = format!("dispatch-worker-{i}");
            info!(worker.name = %name, "starting dispatch worker");

            let worker = Worker {
                name: name.clone(),
                buffer: Arc::clone(&self.buffer),
                adapters: Arc::clone(&self.adapters),
                options: self.options.clone(),
                shutdown: shutdown.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            handles.push(tokio::spawn(
                async move { worker.run().await }.instrument(span),
            ));
        }
        handles
    }
}

struct Worker {
    name: String,
    buffer: Arc<Buffer>,
    adapters: Arc<AdapterRegistry>,
    options: DispatcherOptions,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    // Shutdown is either an explicit signal or the sender going away.
    fn should_stop(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn run(mut self) {
        let mut idle = self.options.idle_backoff_floor;

        loop {
            if self.should_stop() {
                debug!("shutdown requested, worker exiting");
                break;
            }

            let claimed = match self
                .buffer
                .claim(self.options.batch_size, &self.name, self.options.lease_duration)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(%err, "claim failed");
                    self.sleep(idle).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                trace!(?idle, "no pending messages, idling");
                self.sleep(idle).await;
                idle = (idle * 2).min(self.options.idle_backoff_ceiling);
                continue;
            }

            idle = self.options.idle_backoff_floor;
            for message in claimed {
                // Finish the message in flight; anything claimed but not
                // started is recovered by the janitor's lease sweep.
                if self.should_stop() {
                    break;
                }
                self.dispatch(message).await;
            }
        }
    }

    async fn sleep(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn dispatch(&self, message: Message) {
        let span = info_span!(
            "message",
            message.id = message.id,
            destination = ?message.destination,
            topic = %message.topic_or_node,
        );

        async {
            let outcome = self.deliver(&message).await;
            let result = match outcome {
                Outcome::Ok => self.buffer.complete(message.id).await,
                Outcome::Retryable(reason) => {
                    let backoff = retry_backoff(
                        self.options.base_backoff,
                        self.options.max_backoff,
                        message.retry_count,
                    );
                    self.buffer
                        .fail_retry(message.id, &reason, backoff)
                        .await
                        .map(|_| ())
                }
                Outcome::Permanent(reason) => {
                    self.buffer.fail_permanent(message.id, &reason).await
                }
            };

            if let Err(err) = result {
                error!(%err, "failed to record delivery outcome");
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver(&self, message: &Message) -> Outcome {
        // A stored payload that no longer matches its declared type can
        // never deliver; archive instead of burning retries.
        if let Err(err) = transform::decode(&message.value, message.data_type) {
            return Outcome::Permanent(err.to_string());
        }

        let Some(adapter) = self.adapters.get(message.destination) else {
            return Outcome::Retryable(format!(
                "no egress adapter registered for {:?}",
                message.destination
            ));
        };

        let delivery = AssertUnwindSafe(adapter.deliver(message)).catch_unwind();
        match tokio::time::timeout(self.options.per_message_timeout, delivery).await {
            Err(_) => Outcome::Retryable("timeout".to_owned()),
            Ok(Err(panic)) => Outcome::Retryable(panic_message(panic.as_ref())),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

/// Exponential backoff for the next attempt:
/// `min(base * 2^retry_count, max)` with ±20 % jitter.
pub fn retry_backoff(base: Duration, max: Duration, retry_count: i64) -> Duration {
    let exponent = retry_count.clamp(0, 32) as u32;
    let scaled = base
        .as_millis()
        .saturating_mul(1u128 << exponent)
        .min(max.as_millis());
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((scaled as f64 * jitter) as u64)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("panicked: {text}")
    } else {
        "panicked".to_owned()
    }
}
