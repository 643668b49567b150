//! NATS connection configuration

use serde::{Deserialize, Serialize};

/// NATS connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g., "nats://127.0.0.1:4222")
    pub url: String,

    /// Connection name reported to the server
    pub client_id: String,

    /// Ping interval; the server drops us after missed pings
    pub keepalive_secs: u64,

    pub connect_timeout_secs: u64,

    /// Optional authentication token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            client_id: "homebot".to_string(),
            keepalive_secs: 60,
            connect_timeout_secs: 5,
            token: None,
        }
    }
}

/// Map a slash-separated topic (or filter) onto a NATS subject
///
/// `/` becomes `.`, `+` becomes `*` and `#` becomes `>`.
pub fn to_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|level| match level {
            "+" => "*",
            "#" => ">",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Map a concrete NATS subject back to a slash-separated topic
pub fn to_topic(subject: &str) -> String {
    subject.replace('.', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://127.0.0.1:4222");
        assert_eq!(config.keepalive_secs, 60);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_deserializes_partial_camel_case() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"url": "nats://robot:4222", "keepaliveSecs": 15}"#).unwrap();
        assert_eq!(config.url, "nats://robot:4222");
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.connect_timeout_secs, 5);
    }

    #[test]
    fn test_subject_mapping() {
        assert_eq!(to_subject("robot/tts/say"), "robot.tts.say");
        assert_eq!(to_subject("robot/+/status"), "robot.*.status");
        assert_eq!(to_subject("system/health/#"), "system.health.>");
        assert_eq!(to_subject("#"), ">");
        assert_eq!(to_topic("robot.tts.say"), "robot/tts/say");
    }
}
