//! Core message types for the homebot-bus runtime
//!
//! The wire envelope keeps the lowercase keys every robot service already
//! speaks: `{"id", "type", "source", "data", "timestamp", "correlate"}`.

use crate::error::{BusError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Source recorded on envelopes built without an explicit origin
pub const DEFAULT_SOURCE: &str = "unknown";

/// Canonical message wrapper carried by every publish
///
/// Envelopes are immutable once built: fields are private and the builder
/// methods consume `self`. A new envelope always gets a fresh random id
/// unless one is supplied with [`Envelope::with_id`], so identical payloads
/// still produce distinct ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier (msg-<uuid>)
    id: String,

    /// Event type name (e.g., "speech.transcript")
    #[serde(rename = "type")]
    event_type: String,

    /// Service that produced the message
    source: String,

    /// Event payload, validated per subscription model
    data: serde_json::Value,

    /// Seconds since the Unix epoch
    timestamp: f64,

    /// Id of the request this message answers, if any
    #[serde(default)]
    correlate: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: new_message_id(),
            event_type: event_type.into(),
            source: DEFAULT_SOURCE.to_string(),
            data,
            timestamp: now_secs(),
            correlate: None,
        }
    }

    /// Set the originating service
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Tie this envelope to an earlier message id
    pub fn correlate(mut self, id: impl Into<String>) -> Self {
        self.correlate = Some(id.into());
        self
    }

    /// Reuse an id, e.g. when retrying the same logical send
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Parse wire bytes
    ///
    /// Malformed JSON fails with [`BusError::Decode`]; JSON missing a
    /// required field fails with [`BusError::Validation`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| BusError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build an envelope from already-decoded JSON
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| BusError::validation("Envelope", e.to_string()))
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlate.as_deref()
    }
}

/// Transport delivery guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget; dedup is unnecessary
    AtMostOnce,
    /// Broker may redeliver; dedup matters
    #[default]
    AtLeastOnce,
    /// Accepted for completeness, adapters treat it as `AtLeastOnce`
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BusError::Config(format!("QoS must be 0, 1 or 2, got {}", other))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

/// A message as it arrives from (or leaves for) the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Concrete topic the message was published on
    pub topic: String,

    /// Undecoded payload bytes
    pub payload: Bytes,

    pub qos: QoS,

    /// Whether the broker held this as the retained value
    pub retain: bool,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// Lifecycle event reported on the health and keepalive topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthEvent {
    Ready,
    Reconnected,
    Stopped,
    Heartbeat,
}

/// Payload published to `system/health/<service>` and `system/keepalive/<service>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,

    pub event: HealthEvent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    pub timestamp: f64,
}

impl HealthReport {
    /// Liveness after the first (`Ready`) or a later (`Reconnected`) session
    pub fn up(event: HealthEvent) -> Self {
        Self {
            ok: true,
            event,
            err: None,
            timestamp: now_secs(),
        }
    }

    pub fn stopped(err: Option<String>) -> Self {
        Self {
            ok: false,
            event: HealthEvent::Stopped,
            err,
            timestamp: now_secs(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::up(HealthEvent::Heartbeat)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Fresh random message id
pub fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

/// Current time in fractional seconds since the Unix epoch
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let env = Envelope::new("speech.transcript", json!({"text": "hello"}));

        assert!(env.id().starts_with("msg-"));
        assert_eq!(env.event_type(), "speech.transcript");
        assert_eq!(env.source(), DEFAULT_SOURCE);
        assert_eq!(env.data()["text"], "hello");
        assert!(env.timestamp() > 0.0);
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn test_identical_data_gets_distinct_ids() {
        let a = Envelope::new("tts.say", json!({"text": "hi"}));
        let b = Envelope::new("tts.say", json!({"text": "hi"}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_builder_methods() {
        let req = Envelope::new("llm.request", json!({"prompt": "time?"}));
        let resp = Envelope::new("llm.response", json!({"text": "noon"}))
            .with_source("llm")
            .correlate(req.id());

        assert_eq!(resp.source(), "llm");
        assert_eq!(resp.correlation_id(), Some(req.id()));

        let retried = Envelope::new("llm.response", json!({})).with_id("msg-fixed");
        assert_eq!(retried.id(), "msg-fixed");
    }

    #[test]
    fn test_wire_format() {
        let env = Envelope::new("camera.frame", json!({"n": 1})).with_source("camera");
        let bytes = env.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "camera.frame");
        assert_eq!(value["source"], "camera");
        assert!(value["correlate"].is_null());
        assert!(value.get("event_type").is_none());

        let parsed = Envelope::parse(&bytes).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_parse_malformed_json_is_decode_error() {
        let err = Envelope::parse(b"{not json").unwrap_err();
        assert!(matches!(err, BusError::Decode(_)));
    }

    #[test]
    fn test_parse_missing_fields_is_validation_error() {
        let err = Envelope::parse(br#"{"type": "x", "data": {}}"#).unwrap_err();
        assert!(matches!(err, BusError::Validation { .. }));
    }

    #[test]
    fn test_parse_without_correlate() {
        let bytes = br#"{"id":"m1","type":"t","source":"s","data":{},"timestamp":1.5}"#;
        let env = Envelope::parse(bytes).unwrap();
        assert_eq!(env.id(), "m1");
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn test_qos_conversions() {
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(serde_json::to_string(&QoS::AtMostOnce).unwrap(), "0");
        let qos: QoS = serde_json::from_str("2").unwrap();
        assert_eq!(qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_health_report_serialization() {
        let json = serde_json::to_value(HealthReport::up(HealthEvent::Reconnected)).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["event"], "reconnected");
        assert!(json.get("err").is_none());

        let json = serde_json::to_value(HealthReport::stopped(Some("broker gone".into()))).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["event"], "stopped");
        assert_eq!(json["err"], "broker gone");
    }
}
