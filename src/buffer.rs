//! In-process façade over the [`Store`].
//!
//! The buffer owns defaulting and bounds checking on enqueue, the soft
//! capacity cap, per-mapping coalescing, and the transition counters
//! that feed metric snapshots. Dispatcher workers and ingress adapters
//! only ever talk to the store through it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::message::{now_millis, DataType, Destination, Message, NewMessage, Priority, Source};
use crate::stats::Counters;
use crate::store::{FailDisposition, Store};

/// A request to place one message into the buffer.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Where the message entered the bridge.
    pub source: Source,
    /// Where the message must be delivered.
    pub destination: Destination,
    /// Routing key for delivery.
    pub topic_or_node: String,
    /// Payload in canonical wire form.
    pub value: String,
    /// Declared payload type.
    pub data_type: DataType,
    /// Dispatch priority.
    pub priority: Priority,
    /// Per-message attempt budget; the buffer default applies when
    /// absent.
    pub max_retries: Option<u32>,
    /// Per-message time-to-live; the buffer default applies when absent.
    pub ttl: Option<Duration>,
    /// Replace an existing pending row for the same stream instead of
    /// inserting a duplicate.
    pub coalesce: bool,
}

/// Tuning knobs for the buffer façade.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Soft cap on pending rows; non-critical enqueues past it fail with
    /// [`BridgeError::BufferFull`].
    pub max_size: i64,
    /// Default message time-to-live.
    pub default_ttl: Duration,
    /// Default attempt budget.
    pub default_max_retries: u32,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_ttl: Duration::from_secs(3600),
            default_max_retries: 5,
        }
    }
}

/// Public enqueue / claim / complete / fail surface over the store.
pub struct Buffer {
    store: Arc<Store>,
    options: BufferOptions,
    counters: Arc<Counters>,
}

impl Buffer {
    /// Create the façade over a shared store.
    pub fn new(store: Arc<Store>, options: BufferOptions, counters: Arc<Counters>) -> Self {
        Self {
            store,
            options,
            counters,
        }
    }

    /// The shared transition counters feeding metric snapshots.
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// The underlying store.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Enqueue a message, applying defaults, the soft capacity cap and
    /// optional coalescing. Returns the id of the inserted (or
    /// refreshed) row.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<i64, BridgeError> {
        if request.topic_or_node.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "message has an empty topic_or_node".into(),
            ));
        }
        let ttl = request.ttl.unwrap_or(self.options.default_ttl);
        if ttl.is_zero() {
            return Err(BridgeError::Configuration(
                "message TTL must be positive".into(),
            ));
        }

        // Critical traffic bypasses the soft cap.
        if request.priority != Priority::Critical {
            let pending = self.store.pending_count().await?;
            if pending >= self.options.max_size {
                warn!(
                    pending,
                    max_size = self.options.max_size,
                    topic = %request.topic_or_node,
                    "buffer full, rejecting non-critical enqueue"
                );
                return Err(BridgeError::BufferFull);
            }
        }

        let now = now_millis();
        let expire_at = now + ttl.as_millis() as i64;
        let message = NewMessage {
            source: request.source,
            destination: request.destination,
            topic_or_node: request.topic_or_node,
            value: request.value,
            data_type: request.data_type,
            priority: request.priority,
            max_retries: request.max_retries.unwrap_or(self.options.default_max_retries),
        };

        if request.coalesce {
            if let Some(id) = self.store.coalesce_pending(&message, now, expire_at).await? {
                debug!(message.id = id, topic = %message.topic_or_node, "coalesced pending message");
                self.counters.enqueued();
                return Ok(id);
            }
        }

        let id = self.store.insert(&message, now, expire_at).await?;
        self.counters.enqueued();
        debug!(
            message.id = id,
            source = ?message.source,
            destination = ?message.destination,
            topic = %message.topic_or_node,
            "message enqueued"
        );
        Ok(id)
    }

    /// Claim up to `limit` messages for `worker_id` under a lease.
    pub async fn claim(
        &self,
        limit: u32,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Message>, BridgeError> {
        self.store.claim(limit, worker_id, lease_duration).await
    }

    /// Mark a leased message delivered.
    pub async fn complete(&self, id: i64) -> Result<(), BridgeError> {
        if self.store.complete(id).await? {
            self.counters.completed();
            info!(message.id = id, "message completed");
        } else {
            debug!(message.id = id, "completion skipped, message no longer leased");
        }
        Ok(())
    }

    /// Record a retryable failure, requeueing with `backoff` or
    /// archiving when the budget is spent.
    pub async fn fail_retry(
        &self,
        id: i64,
        error: &str,
        backoff: Duration,
    ) -> Result<FailDisposition, BridgeError> {
        let disposition = self.store.fail_retry(id, error, backoff).await?;
        match disposition {
            FailDisposition::Requeued { attempt, .. } => {
                self.counters.retried(1);
                warn!(message.id = id, attempt, error, "delivery failed, requeued");
            }
            FailDisposition::Archived => {
                self.counters.failed();
                tracing::error!(message.id = id, error, "retry budget exhausted, archived");
            }
            FailDisposition::Skipped => {
                debug!(message.id = id, "failure skipped, message no longer leased");
            }
        }
        Ok(disposition)
    }

    /// Archive a message immediately, bypassing the retry budget.
    pub async fn fail_permanent(&self, id: i64, error: &str) -> Result<(), BridgeError> {
        if self.store.fail_permanent(id, error).await? {
            self.counters.failed();
            tracing::error!(message.id = id, error, "message permanently failed");
        }
        Ok(())
    }
}
