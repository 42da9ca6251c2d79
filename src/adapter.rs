//! Ingress and egress adapter contracts.
//!
//! Transports are external collaborators: an MQTT client, an OPC-UA
//! server, or a SAP connector plugs in by implementing [`EgressAdapter`]
//! and feeding [`IngressRouter::push`]. The bridge core never touches a
//! socket itself.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::buffer::{Buffer, EnqueueRequest};
use crate::error::BridgeError;
use crate::mapping::MappingTable;
use crate::message::{Destination, Message, Source};
use crate::transform;

/// Result of one egress delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; the message completes.
    Ok,
    /// Transient failure; the message is requeued with backoff while
    /// budget remains.
    Retryable(String),
    /// Non-recoverable rejection; the message is archived immediately.
    Permanent(String),
}

/// A delivery shim for one destination (OPC-UA write, MQTT publish,
/// SAP upload).
///
/// Implementations classify their own failures into the [`Outcome`]
/// taxonomy; the dispatcher never inspects transport error types. A
/// panic inside `deliver` is treated as retryable.
pub trait EgressAdapter: Send + Sync {
    /// Attempt to deliver one message to its `topic_or_node`.
    fn deliver<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Outcome>;
}

/// Egress adapters keyed by destination, fixed after startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Destination, Arc<dyn EgressAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the adapter handling `destination`, replacing any
    /// previous one.
    pub fn register(&mut self, destination: Destination, adapter: Arc<dyn EgressAdapter>) {
        self.adapters.insert(destination, adapter);
    }

    /// Adapter for a destination, if registered.
    pub fn get(&self, destination: Destination) -> Option<Arc<dyn EgressAdapter>> {
        self.adapters.get(&destination).cloned()
    }
}

/// An external event entering the bridge: an MQTT publish received on a
/// subscription, or an OPC-UA data-change notification.
#[derive(Debug, Clone)]
pub struct IngressEvent {
    /// Which transport produced the event.
    pub source: Source,
    /// MQTT topic or OPC-UA node identifier the event arrived on.
    pub key: String,
    /// Raw payload as text.
    pub payload: String,
}

/// Mapping lookup and enqueue path shared by all ingress adapters.
pub struct IngressRouter {
    table: Arc<MappingTable>,
    buffer: Arc<Buffer>,
}

impl IngressRouter {
    /// Create a router over the shared mapping table and buffer.
    pub fn new(table: Arc<MappingTable>, buffer: Arc<Buffer>) -> Self {
        Self { table, buffer }
    }

    /// Route one ingress event: look up its mappings, coerce and
    /// transform the payload, and enqueue once per matched route.
    ///
    /// Payloads that fail coercion are archived immediately (permanent,
    /// no retry). A full buffer drops the message with a warning, per
    /// the ingress backpressure policy. Returns the ids of enqueued
    /// messages.
    pub async fn push(&self, event: &IngressEvent) -> Result<Vec<i64>, BridgeError> {
        let routes = self.table.routes_for(event.source, &event.key);
        if routes.is_empty() {
            debug!(source = ?event.source, key = %event.key, "no mapping for ingress event");
            return Ok(Vec::new());
        }

        let mut enqueued = Vec::with_capacity(routes.len());
        for route in routes {
            let prepared = transform::coerce(&event.payload, route.data_type)
                .and_then(|canonical| (route.transform)(&canonical, route.data_type));

            let request = EnqueueRequest {
                source: event.source,
                destination: route.destination,
                topic_or_node: route.target.clone(),
                value: match &prepared {
                    Ok(value) => value.clone(),
                    // Keep the raw payload so the archive row shows what
                    // was rejected.
                    Err(_) => event.payload.clone(),
                },
                data_type: route.data_type,
                priority: route.priority,
                max_retries: route.max_retries,
                ttl: None,
                // A rejected payload must not replace a healthy pending
                // row on its way to the archive.
                coalesce: route.coalesce && prepared.is_ok(),
            };

            match self.buffer.enqueue(request).await {
                Ok(id) => match prepared {
                    Ok(_) => enqueued.push(id),
                    Err(err) => {
                        self.buffer.fail_permanent(id, &err.to_string()).await?;
                    }
                },
                Err(BridgeError::BufferFull) => {
                    warn!(
                        source = ?event.source,
                        key = %event.key,
                        target = %route.target,
                        "buffer full, dropping ingress event"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(enqueued)
    }
}
