//! Topic registry and MQTT-style topic matching
//!
//! Topics are `/`-delimited. In subscription filters `+` matches exactly one
//! level and `#` matches all remaining levels (final segment only).

use crate::error::{BusError, Result};
use std::collections::HashMap;

/// Prefix of the retained per-service health topics
pub const HEALTH_PREFIX: &str = "system/health";

/// Prefix of the per-service heartbeat topics
pub const KEEPALIVE_PREFIX: &str = "system/keepalive";

/// Retained health topic for a service
pub fn health_topic(service_id: &str) -> String {
    format!("{}/{}", HEALTH_PREFIX, service_id)
}

/// Heartbeat topic for a service
pub fn keepalive_topic(service_id: &str) -> String {
    format!("{}/{}", KEEPALIVE_PREFIX, service_id)
}

/// Check a subscription filter for well-formed wildcards
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(invalid(filter, "topic filter cannot be empty"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(invalid(filter, "'#' must be the whole final level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid(filter, "'+' must occupy an entire level"));
        }
    }
    Ok(())
}

/// Check a concrete (publishable) topic
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(invalid(topic, "topic cannot be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid(topic, "wildcards are not allowed in a concrete topic"));
    }
    Ok(())
}

/// Whether a concrete topic matches a subscription filter
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn invalid(topic: &str, reason: &str) -> BusError {
    BusError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

/// Bidirectional event-type ↔ topic mapping, fixed at startup
///
/// Lookups are total over the configured pairs; a miss is a configuration
/// bug and fails with [`BusError::UnknownTopic`] instead of falling back.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    by_event: HashMap<String, String>,
    by_topic: HashMap<String, String>,
}

impl TopicRegistry {
    /// Build a registry from `(event_type, topic)` pairs
    pub fn new<I, E, T>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (E, T)>,
        E: Into<String>,
        T: Into<String>,
    {
        let mut registry = Self::default();

        for (event_type, topic) in pairs {
            let event_type = event_type.into();
            let topic = topic.into();

            if event_type.is_empty() {
                return Err(BusError::Config("Event type cannot be empty".to_string()));
            }
            validate_topic(&topic).map_err(|e| BusError::Config(e.to_string()))?;

            if registry.by_event.contains_key(&event_type) {
                return Err(BusError::Config(format!(
                    "Event type '{}' is mapped more than once",
                    event_type
                )));
            }
            if let Some(existing) = registry.by_topic.get(&topic) {
                return Err(BusError::Config(format!(
                    "Topic '{}' is already mapped to event type '{}'",
                    topic, existing
                )));
            }

            registry.by_topic.insert(topic.clone(), event_type.clone());
            registry.by_event.insert(event_type, topic);
        }

        tracing::debug!(entries = registry.len(), "Topic registry built");
        Ok(registry)
    }

    /// Topic an event type is published on
    pub fn resolve_topic(&self, event_type: &str) -> Result<&str> {
        self.by_event
            .get(event_type)
            .map(String::as_str)
            .ok_or_else(|| BusError::UnknownTopic(event_type.to_string()))
    }

    /// Event type carried by a concrete topic
    pub fn resolve_event(&self, topic: &str) -> Result<&str> {
        self.by_topic
            .get(topic)
            .map(String::as_str)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_event.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.by_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}
