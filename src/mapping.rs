//! Static routing from ingress keys to egress targets.
//!
//! The table is built once from configuration and immutable afterwards.
//! MQTT topic lookups support trailing-wildcard mappings with the usual
//! `+` (single level) and `#` (multi level) semantics; precedence is
//! exact > single-level > multi-level.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Mapping;
use crate::error::BridgeError;
use crate::message::{DataType, Destination, Priority, Source};
use crate::transform::{self, Transform};

/// Direction of a configured mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// MQTT subscription feeding an OPC-UA node.
    MqttToOpcua,
    /// OPC-UA change notifications feeding an MQTT topic.
    OpcuaToMqtt,
    /// Both directions registered.
    Bidirectional,
}

/// One resolved routing record: where a matched ingress value goes and
/// how it is typed, prioritised and retried.
#[derive(Debug, Clone)]
pub struct Route {
    /// Egress side the message is delivered to.
    pub destination: Destination,
    /// Routing key on the egress side.
    pub target: String,
    /// Declared payload type for coercion.
    pub data_type: DataType,
    /// Dispatch priority for messages on this route.
    pub priority: Priority,
    /// Per-route attempt budget override.
    pub max_retries: Option<u32>,
    /// Whether pending duplicates on this route are coalesced.
    pub coalesce: bool,
    /// Payload transform applied between coercion and enqueue.
    pub transform: Transform,
}

/// Immutable routing table derived from the `mappings` configuration.
pub struct MappingTable {
    mqtt_exact: HashMap<String, Vec<Route>>,
    mqtt_single: Vec<(String, Vec<Route>)>,
    mqtt_multi: Vec<(String, Vec<Route>)>,
    opcua_exact: HashMap<String, Vec<Route>>,
}

impl MappingTable {
    /// Build the table, resolving transform names. A `bidirectional`
    /// mapping registers both lookup directions.
    pub fn build(mappings: &[Mapping]) -> Result<Self, BridgeError> {
        let mut table = Self {
            mqtt_exact: HashMap::new(),
            mqtt_single: Vec::new(),
            mqtt_multi: Vec::new(),
            opcua_exact: HashMap::new(),
        };

        for mapping in mappings {
            let transform = match &mapping.transform {
                Some(name) => transform::resolve(name)?,
                None => transform::identity,
            };
            let priority = mapping.priority.unwrap_or(Priority::Normal);
            let coalesce = mapping.coalesce.unwrap_or(false);

            if matches!(
                mapping.direction,
                Direction::MqttToOpcua | Direction::Bidirectional
            ) {
                let route = Route {
                    destination: Destination::Opcua,
                    target: mapping.opcua_node_id.clone(),
                    data_type: mapping.data_type,
                    priority,
                    max_retries: mapping.max_retries,
                    coalesce,
                    transform,
                };
                table.add_mqtt(&mapping.mqtt_topic, route)?;
            }

            if matches!(
                mapping.direction,
                Direction::OpcuaToMqtt | Direction::Bidirectional
            ) {
                if mapping.mqtt_topic.contains('+') || mapping.mqtt_topic.contains('#') {
                    return Err(BridgeError::Configuration(format!(
                        "mapping {:?} publishes to a wildcard MQTT topic",
                        mapping.mqtt_topic
                    )));
                }
                let route = Route {
                    destination: Destination::Mqtt,
                    target: mapping.mqtt_topic.clone(),
                    data_type: mapping.data_type,
                    priority,
                    max_retries: mapping.max_retries,
                    coalesce,
                    transform,
                };
                table
                    .opcua_exact
                    .entry(mapping.opcua_node_id.clone())
                    .or_default()
                    .push(route);
            }
        }

        Ok(table)
    }

    fn add_mqtt(&mut self, pattern: &str, route: Route) -> Result<(), BridgeError> {
        if pattern.contains('#') {
            let trailing = pattern == "#" || pattern.ends_with("/#");
            if !trailing || pattern.matches('#').count() > 1 {
                return Err(BridgeError::Configuration(format!(
                    "invalid MQTT filter {pattern:?}: '#' must be the final level"
                )));
            }
            push_pattern(&mut self.mqtt_multi, pattern, route);
        } else if pattern.contains('+') {
            push_pattern(&mut self.mqtt_single, pattern, route);
        } else {
            self.mqtt_exact
                .entry(pattern.to_owned())
                .or_default()
                .push(route);
        }
        Ok(())
    }

    /// Routes for an ingress event. SAP and internal sources carry no
    /// configured mappings and resolve to nothing.
    pub fn routes_for(&self, source: Source, key: &str) -> Vec<&Route> {
        match source {
            Source::Mqtt => self.routes_for_mqtt(key),
            Source::Opcua => self
                .opcua_exact
                .get(key)
                .map(|routes| routes.iter().collect())
                .unwrap_or_default(),
            Source::Sap | Source::Internal => Vec::new(),
        }
    }

    /// Routes for an MQTT topic, applying the exact > `+` > `#`
    /// precedence. Only the highest matching tier contributes.
    pub fn routes_for_mqtt(&self, topic: &str) -> Vec<&Route> {
        if let Some(routes) = self.mqtt_exact.get(topic) {
            return routes.iter().collect();
        }

        let single: Vec<&Route> = self
            .mqtt_single
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .flat_map(|(_, routes)| routes.iter())
            .collect();
        if !single.is_empty() {
            return single;
        }

        self.mqtt_multi
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .flat_map(|(_, routes)| routes.iter())
            .collect()
    }

    /// Whether the table holds no routes at all.
    pub fn is_empty(&self) -> bool {
        self.mqtt_exact.is_empty()
            && self.mqtt_single.is_empty()
            && self.mqtt_multi.is_empty()
            && self.opcua_exact.is_empty()
    }
}

fn push_pattern(tier: &mut Vec<(String, Vec<Route>)>, pattern: &str, route: Route) {
    if let Some((_, routes)) = tier.iter_mut().find(|(p, _)| p == pattern) {
        routes.push(route);
    } else {
        tier.push((pattern.to_owned(), vec![route]));
    }
}

/// MQTT topic filter matching: `+` matches exactly one level, a trailing
/// `#` matches the remainder (including zero levels).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
