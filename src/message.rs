//! Message records and their lifecycle vocabulary.
//!
//! A [`Message`] is the unit of transfer between the ingress and egress
//! sides of the bridge. Rows live in the `messages` table; terminally
//! failed or expired rows additionally get an append-only entry in the
//! `failed_messages` archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Where a message entered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Source {
    /// Received from the MQTT broker.
    Mqtt,
    /// Produced by an OPC-UA change notification.
    Opcua,
    /// Produced by the SAP connector.
    Sap,
    /// Generated by the bridge itself.
    Internal,
}

/// Where a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Destination {
    /// Published to the MQTT broker.
    Mqtt,
    /// Written to an OPC-UA node.
    Opcua,
    /// Forwarded to the SAP connector.
    Sap,
}

/// Processing state of a message.
///
/// `Completed`, `Failed` and `Expired` are terminal: no transition may
/// originate from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    /// Waiting to be claimed by a dispatcher worker.
    Pending,
    /// Leased by a worker; `lease_owner` and `lease_deadline` are set.
    Processing,
    /// Delivered successfully.
    Completed,
    /// Retry budget exhausted or permanently rejected; archived.
    Failed,
    /// Time-to-live elapsed before delivery; archived.
    Expired,
}

impl Status {
    /// Whether this state permits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Expired)
    }
}

/// Dispatch priority. Lower values are claimed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum Priority {
    /// Dispatched before everything else; bypasses the soft capacity cap.
    Critical = 0,
    /// Dispatched before normal traffic.
    High = 1,
    /// Default priority.
    Normal = 2,
    /// Background traffic.
    Low = 3,
}

/// Declared payload type; governs the canonical wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum DataType {
    /// `"true"` / `"false"`, case-insensitive on ingress.
    Boolean,
    /// Decimal integer within the 32-bit signed range.
    Int32,
    /// 32-bit IEEE 754; NaN and infinities rejected.
    Float,
    /// 64-bit IEEE 754.
    Double,
    /// UTF-8 text, passed through verbatim.
    String,
    /// ISO 8601 with an explicit timezone offset.
    DateTime,
    /// Valid JSON text, stored in compact form.
    #[serde(rename = "JSON")]
    #[sqlx(rename = "JSON")]
    Json,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Boolean => "Boolean",
            DataType::Int32 => "Int32",
            DataType::Float => "Float",
            DataType::Double => "Double",
            DataType::String => "String",
            DataType::DateTime => "DateTime",
            DataType::Json => "JSON",
        };
        f.write_str(name)
    }
}

/// A message row as stored in the `messages` table.
///
/// Timestamps are UTC milliseconds since the Unix epoch.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    /// Unique identifier, assigned by the store on insert.
    pub id: i64,
    /// Where the message entered the bridge.
    pub source: Source,
    /// Where the message is delivered.
    pub destination: Destination,
    /// MQTT topic or OPC-UA node identifier used for delivery.
    pub topic_or_node: String,
    /// Payload in the canonical wire form of `data_type`.
    pub value: String,
    /// Declared payload type.
    pub data_type: DataType,
    /// Current lifecycle state.
    pub status: Status,
    /// Dispatch priority.
    pub priority: Priority,
    /// Failed attempts so far.
    pub retry_count: i64,
    /// Attempt budget; at `retry_count == max_retries` the next failure
    /// is terminal.
    pub max_retries: i64,
    /// Insertion time (refreshed when a coalescing enqueue replaces the
    /// pending value).
    pub created_at: i64,
    /// Completion time, set on the transition to `completed`.
    pub processed_at: Option<i64>,
    /// Deadline after which the message is eligible for expiry.
    pub expire_at: i64,
    /// Earliest time the next dispatch attempt may be claimed.
    pub next_attempt_at: i64,
    /// Worker identity holding the lease, while `processing`.
    pub lease_owner: Option<String>,
    /// Wall-clock deadline after which a `processing` lease may be
    /// reclaimed.
    pub lease_deadline: Option<i64>,
    /// Summary of the most recent failure.
    pub last_error: Option<String>,
}

/// Payload for inserting a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Where the message entered the bridge.
    pub source: Source,
    /// Where the message is delivered.
    pub destination: Destination,
    /// Routing key for delivery.
    pub topic_or_node: String,
    /// Payload in canonical wire form.
    pub value: String,
    /// Declared payload type.
    pub data_type: DataType,
    /// Dispatch priority.
    pub priority: Priority,
    /// Attempt budget for this message.
    pub max_retries: u32,
}

/// An entry in the append-only `failed_messages` archive.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FailedMessage {
    /// Archive row identifier.
    pub id: i64,
    /// Identifier the message had in the `messages` table.
    pub original_id: i64,
    /// Where the message entered the bridge.
    pub source: Source,
    /// Where the message was supposed to be delivered.
    pub destination: Destination,
    /// Routing key the delivery was attempted against.
    pub topic_or_node: String,
    /// Payload at the time of archiving.
    pub value: String,
    /// Why the message was archived (`ttl` for expiry, `integrity` for
    /// quarantined rows, otherwise the last delivery error).
    pub error_message: String,
    /// When the message reached its terminal state.
    pub failed_at: i64,
    /// Attempts made before archiving.
    pub retry_count: i64,
}

/// One `(timestamp, name, value)` row from the `statistics` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MetricRow {
    /// Snapshot time in epoch milliseconds.
    pub timestamp: i64,
    /// One of the closed set of metric names in [`crate::stats`].
    pub metric_name: String,
    /// Counter delta or gauge value at `timestamp`.
    pub metric_value: f64,
}

/// Current UTC time in epoch milliseconds, the store's clock unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render an epoch-millisecond timestamp as UTC ISO 8601.
pub fn format_millis(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(ts) => ts.to_rfc3339(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Processing.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Expired.is_terminal());
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn data_type_serde_names_are_canonical() {
        let yaml: DataType = serde_yaml::from_str("JSON").unwrap();
        assert_eq!(yaml, DataType::Json);
        let yaml: DataType = serde_yaml::from_str("Int32").unwrap();
        assert_eq!(yaml, DataType::Int32);
        assert_eq!(DataType::Json.to_string(), "JSON");
    }
}
