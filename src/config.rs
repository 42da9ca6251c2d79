//! YAML configuration.
//!
//! All sections reject unknown keys at load time. The optional
//! `schema_version` must fall within the supported range. Transform
//! names in mappings are resolved eagerly so a typo fails startup
//! instead of the first message.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::buffer::BufferOptions;
use crate::dispatcher::DispatcherOptions;
use crate::error::BridgeError;
use crate::janitor::JanitorOptions;
use crate::mapping::Direction;
use crate::message::{DataType, Priority};
use crate::transform;

/// Configuration schema versions this build understands.
pub const SUPPORTED_SCHEMA_VERSIONS: std::ops::RangeInclusive<u32> = 1..=1;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Optional schema version; must lie in
    /// [`SUPPORTED_SCHEMA_VERSIONS`] when present.
    #[serde(default)]
    pub schema_version: Option<u32>,
    /// MQTT transport settings, handed to the external client.
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// OPC-UA server settings, handed to the external endpoint.
    #[serde(default)]
    pub opcua: OpcuaConfig,
    /// Core buffer and dispatch tuning.
    #[serde(default)]
    pub buffer: BufferSettings,
    /// Routing table entries.
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// MQTT transport settings. The bridge core only stores these; the
/// external MQTT client consumes them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    /// Broker hostname or address.
    #[serde(default = "defaults::broker_host")]
    pub broker_host: String,
    /// Broker port.
    #[serde(default = "defaults::broker_port")]
    pub broker_port: u16,
    /// Client identifier presented to the broker.
    #[serde(default = "defaults::client_id")]
    pub client_id: String,
    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Subscribe/publish QoS level (0-2).
    #[serde(default = "defaults::qos")]
    pub qos: u8,
    /// Whether to connect over TLS.
    #[serde(default)]
    pub tls_enabled: bool,
    /// CA certificate path for TLS.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Client certificate path for mutual TLS.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    /// Client key path for mutual TLS.
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: defaults::broker_host(),
            broker_port: defaults::broker_port(),
            client_id: defaults::client_id(),
            username: None,
            password: None,
            qos: defaults::qos(),
            tls_enabled: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

/// OPC-UA server settings, consumed by the external endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpcuaConfig {
    /// Endpoint URL the server binds.
    #[serde(default = "defaults::endpoint")]
    pub endpoint: String,
    /// Advertised server name.
    #[serde(default = "defaults::server_name")]
    pub server_name: String,
    /// Registered namespace URI.
    #[serde(default = "defaults::namespace")]
    pub namespace: String,
    /// Security policy name (e.g. `NoSecurity`, `Basic256Sha256`).
    #[serde(default = "defaults::security_policy")]
    pub security_policy: String,
    /// Server certificate path.
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    /// Server private key path.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Whether anonymous sessions are accepted.
    #[serde(default = "defaults::allow_anonymous")]
    pub allow_anonymous: bool,
}

impl Default for OpcuaConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::endpoint(),
            server_name: defaults::server_name(),
            namespace: defaults::namespace(),
            security_policy: defaults::security_policy(),
            certificate: None,
            private_key: None,
            allow_anonymous: defaults::allow_anonymous(),
        }
    }
}

/// Core buffer, dispatcher and janitor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferSettings {
    /// Store file path.
    #[serde(default = "defaults::db_path")]
    pub db_path: PathBuf,
    /// Soft cap on pending rows.
    #[serde(default = "defaults::max_size")]
    pub max_size: i64,
    /// Number of dispatcher workers.
    #[serde(default = "defaults::worker_threads")]
    pub worker_threads: usize,
    /// Claim lease duration in seconds.
    #[serde(default = "defaults::lease_duration_s")]
    pub lease_duration_s: u64,
    /// Upper bound on one egress call, in seconds.
    #[serde(default = "defaults::per_message_timeout_s")]
    pub per_message_timeout_s: u64,
    /// Janitor sweep interval in seconds.
    #[serde(default = "defaults::cleanup_interval_s")]
    pub cleanup_interval_s: u64,
    /// Retention of completed rows, in days.
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,
    /// Default message TTL in minutes; fractional values allowed.
    #[serde(default = "defaults::message_ttl_minutes")]
    pub message_ttl_minutes: f64,
    /// First-retry backoff in seconds.
    #[serde(default = "defaults::base_backoff_s")]
    pub base_backoff_s: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "defaults::max_backoff_s")]
    pub max_backoff_s: u64,
    /// Default per-message attempt budget.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Metric snapshot flush interval in seconds.
    #[serde(default = "defaults::stats_flush_interval_s")]
    pub stats_flush_interval_s: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            db_path: defaults::db_path(),
            max_size: defaults::max_size(),
            worker_threads: defaults::worker_threads(),
            lease_duration_s: defaults::lease_duration_s(),
            per_message_timeout_s: defaults::per_message_timeout_s(),
            cleanup_interval_s: defaults::cleanup_interval_s(),
            retention_days: defaults::retention_days(),
            message_ttl_minutes: defaults::message_ttl_minutes(),
            base_backoff_s: defaults::base_backoff_s(),
            max_backoff_s: defaults::max_backoff_s(),
            max_retries: defaults::max_retries(),
            stats_flush_interval_s: defaults::stats_flush_interval_s(),
        }
    }
}

/// One routing table entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mapping {
    /// MQTT topic, or topic filter for `mqtt_to_opcua` mappings.
    pub mqtt_topic: String,
    /// OPC-UA node identifier.
    pub opcua_node_id: String,
    /// Declared payload type.
    pub data_type: DataType,
    /// Which direction(s) this mapping registers.
    pub direction: Direction,
    /// Dispatch priority; `normal` when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Attempt budget override for this route.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Coalesce pending duplicates on this route; off by default.
    #[serde(default)]
    pub coalesce: Option<bool>,
    /// Named payload transform; must exist in the registry.
    #[serde(default)]
    pub transform: Option<String>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn broker_host() -> String {
        "localhost".to_owned()
    }
    pub fn broker_port() -> u16 {
        1883
    }
    pub fn client_id() -> String {
        "telebridge".to_owned()
    }
    pub fn qos() -> u8 {
        1
    }
    pub fn endpoint() -> String {
        "opc.tcp://0.0.0.0:4840/bridge/server/".to_owned()
    }
    pub fn server_name() -> String {
        "Telebridge OPC-UA Server".to_owned()
    }
    pub fn namespace() -> String {
        "urn:telebridge".to_owned()
    }
    pub fn security_policy() -> String {
        "NoSecurity".to_owned()
    }
    pub fn allow_anonymous() -> bool {
        true
    }
    pub fn db_path() -> PathBuf {
        PathBuf::from("buffer.db")
    }
    pub fn max_size() -> i64 {
        10_000
    }
    pub fn worker_threads() -> usize {
        2
    }
    pub fn lease_duration_s() -> u64 {
        60
    }
    pub fn per_message_timeout_s() -> u64 {
        10
    }
    pub fn cleanup_interval_s() -> u64 {
        60
    }
    pub fn retention_days() -> u32 {
        7
    }
    pub fn message_ttl_minutes() -> f64 {
        60.0
    }
    pub fn base_backoff_s() -> u64 {
        1
    }
    pub fn max_backoff_s() -> u64 {
        300
    }
    pub fn max_retries() -> u32 {
        5
    }
    pub fn stats_flush_interval_s() -> u64 {
        10
    }
}

impl BridgeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BridgeError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, BridgeError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| BridgeError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if let Some(version) = self.schema_version {
            if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
                return Err(BridgeError::Configuration(format!(
                    "schema_version {version} is outside the supported range \
                     {}..={}",
                    SUPPORTED_SCHEMA_VERSIONS.start(),
                    SUPPORTED_SCHEMA_VERSIONS.end()
                )));
            }
        }
        if self.mqtt.qos > 2 {
            return Err(BridgeError::Configuration(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.buffer.worker_threads == 0 {
            return Err(BridgeError::Configuration(
                "buffer.worker_threads must be at least 1".into(),
            ));
        }
        if !(self.buffer.message_ttl_minutes > 0.0) {
            return Err(BridgeError::Configuration(
                "buffer.message_ttl_minutes must be positive".into(),
            ));
        }
        if self.buffer.max_size <= 0 {
            return Err(BridgeError::Configuration(
                "buffer.max_size must be positive".into(),
            ));
        }

        let mut seen_topics = HashSet::new();
        for mapping in &self.mappings {
            if mapping.mqtt_topic.is_empty() || mapping.opcua_node_id.is_empty() {
                return Err(BridgeError::Configuration(
                    "mappings require both mqtt_topic and opcua_node_id".into(),
                ));
            }
            if let Some(name) = &mapping.transform {
                transform::resolve(name)?;
            }
            if !seen_topics.insert((&mapping.mqtt_topic, mapping.direction)) {
                warn!(topic = %mapping.mqtt_topic, "duplicate MQTT topic in mappings");
            }
        }

        Ok(())
    }

    /// Buffer façade options derived from this configuration.
    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            max_size: self.buffer.max_size,
            default_ttl: Duration::from_secs_f64(self.buffer.message_ttl_minutes * 60.0),
            default_max_retries: self.buffer.max_retries,
        }
    }

    /// Dispatcher options derived from this configuration.
    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            workers: self.buffer.worker_threads,
            lease_duration: Duration::from_secs(self.buffer.lease_duration_s),
            per_message_timeout: Duration::from_secs(self.buffer.per_message_timeout_s),
            base_backoff: Duration::from_secs(self.buffer.base_backoff_s),
            max_backoff: Duration::from_secs(self.buffer.max_backoff_s),
            ..DispatcherOptions::default()
        }
    }

    /// Janitor options derived from this configuration.
    pub fn janitor_options(&self) -> JanitorOptions {
        JanitorOptions {
            interval: Duration::from_secs(self.buffer.cleanup_interval_s),
            retention: Duration::from_secs(u64::from(self.buffer.retention_days) * 24 * 3600),
        }
    }

    /// Metric snapshot flush interval.
    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.stats_flush_interval_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
mappings:
  - mqtt_topic: "sensores/temperatura/sala"
    opcua_node_id: "ns=2;s=Temperature.Room"
    data_type: Float
    direction: mqtt_to_opcua
"#;

    const FULL_YAML: &str = r#"
schema_version: 1
mqtt:
  broker_host: "broker.plant.local"
  broker_port: 8883
  client_id: "plant-bridge"
  username: "bridge"
  password: "secret"
  qos: 2
  tls_enabled: true
  ca_cert: "/etc/bridge/ca.pem"
opcua:
  endpoint: "opc.tcp://0.0.0.0:4840/plant/"
  server_name: "Plant Bridge"
  namespace: "urn:plant"
  security_policy: "Basic256Sha256"
  allow_anonymous: false
buffer:
  db_path: "/var/lib/bridge/buffer.db"
  max_size: 5000
  worker_threads: 4
  lease_duration_s: 30
  per_message_timeout_s: 5
  cleanup_interval_s: 120
  retention_days: 3
  message_ttl_minutes: 15.0
  base_backoff_s: 2
  max_backoff_s: 60
  max_retries: 3
  stats_flush_interval_s: 5
mappings:
  - mqtt_topic: "plant/+/temperature"
    opcua_node_id: "ns=2;s=Temperature"
    data_type: Float
    direction: mqtt_to_opcua
    priority: high
    coalesce: true
    transform: celsius_to_fahrenheit
  - mqtt_topic: "plant/light"
    opcua_node_id: "ns=2;s=Light"
    data_type: Boolean
    direction: bidirectional
    max_retries: 8
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = BridgeConfig::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(config.mqtt.broker_host, "localhost");
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.buffer.max_size, 10_000);
        assert_eq!(config.buffer.worker_threads, 2);
        assert_eq!(config.buffer.max_retries, 5);
        assert_eq!(config.mappings.len(), 1);
        assert!(config.mappings[0].priority.is_none());
    }

    #[test]
    fn full_config_round_trips_every_section() {
        let config = BridgeConfig::from_yaml(FULL_YAML).unwrap();
        assert_eq!(config.schema_version, Some(1));
        assert_eq!(config.mqtt.qos, 2);
        assert!(config.mqtt.tls_enabled);
        assert_eq!(config.opcua.security_policy, "Basic256Sha256");
        assert!(!config.opcua.allow_anonymous);
        assert_eq!(config.buffer.worker_threads, 4);
        assert_eq!(config.mappings[0].priority, Some(Priority::High));
        assert_eq!(config.mappings[0].coalesce, Some(true));
        assert_eq!(config.mappings[1].max_retries, Some(8));

        let dispatcher = config.dispatcher_options();
        assert_eq!(dispatcher.workers, 4);
        assert_eq!(dispatcher.lease_duration, Duration::from_secs(30));
        assert_eq!(config.janitor_options().interval, Duration::from_secs(120));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "buffer:\n  db_path: x.db\n  no_such_knob: 7\n";
        assert!(matches!(
            BridgeConfig::from_yaml(yaml),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let yaml = "schema_version: 99\n";
        assert!(matches!(
            BridgeConfig::from_yaml(yaml),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_transform_is_rejected() {
        let yaml = r#"
mappings:
  - mqtt_topic: "a/b"
    opcua_node_id: "ns=2;s=A"
    data_type: Float
    direction: mqtt_to_opcua
    transform: frobnicate
"#;
        assert!(matches!(
            BridgeConfig::from_yaml(yaml),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn fractional_ttl_is_accepted() {
        let yaml = "buffer:\n  message_ttl_minutes: 0.05\n";
        let config = BridgeConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.buffer_options().default_ttl,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let yaml = "mqtt:\n  qos: 3\n";
        assert!(matches!(
            BridgeConfig::from_yaml(yaml),
            Err(BridgeError::Configuration(_))
        ));
    }
}
