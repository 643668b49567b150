//! Time-windowed message deduplication
//!
//! Identity is content based: `(type, data.seq)` when the payload carries a
//! `seq` field, otherwise `(type, hash of canonical data)`. Envelope ids are
//! ignored on purpose, since two envelopes built from the same data carry
//! different random ids yet describe the same logical message.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::provider::{MessageStream, Subscriber};
use crate::types::{Envelope, QoS};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Dedup key for one logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    event_type: String,
    key: IdentityKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdentityKey {
    /// Producer-assigned sequence value, as canonical JSON
    Seq(String),
    /// Hash of the canonical JSON payload
    Content(u64),
}

impl Identity {
    pub fn of(envelope: &Envelope) -> Self {
        let key = match envelope.data().get("seq") {
            Some(seq) => IdentityKey::Seq(canonical_json(seq)),
            None => {
                let mut hasher = DefaultHasher::new();
                canonical_json(envelope.data()).hash(&mut hasher);
                IdentityKey::Content(hasher.finish())
            }
        };

        Self {
            event_type: envelope.event_type().to_string(),
            key,
        }
    }
}

/// JSON text with object keys sorted at every level
fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// TTL- and size-bounded cache of recently seen message identities
///
/// Expiry is lazy: every check first drops entries older than the TTL, so
/// no background timer is needed. A TTL of zero disables deduplication.
#[derive(Debug)]
pub struct MessageDeduplicator {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<Identity, Instant>,
    /// Insertion order, oldest first
    order: VecDeque<(Identity, Instant)>,
}

impl MessageDeduplicator {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// A deduplicator that never reports duplicates
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Whether these raw bytes repeat a message seen within the TTL
    ///
    /// Unparseable payloads are never duplicates: dedup fails open.
    pub fn is_duplicate(&mut self, raw: &[u8]) -> bool {
        match Envelope::parse(raw) {
            Ok(envelope) => self.check(&envelope),
            Err(_) => false,
        }
    }

    /// Record an envelope, returning `true` if its identity is still live
    pub fn check(&mut self, envelope: &Envelope) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let identity = Identity::of(envelope);
        let now = Instant::now();
        self.evict_expired(now);

        if self.seen.contains_key(&identity) {
            return true;
        }

        self.seen.insert(identity.clone(), now);
        self.order.push_back((identity, now));

        if self.seen.len() > self.max_entries {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    /// Whether an identity is held and unexpired, without recording it
    pub fn contains(&self, identity: &Identity) -> bool {
        self.seen
            .get(identity)
            .is_some_and(|at| at.elapsed() <= self.ttl)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) <= self.ttl {
                break;
            }
            if let Some((identity, _)) = self.order.pop_front() {
                self.seen.remove(&identity);
            }
        }
    }
}

/// Subscriber wrapper that drops repeat deliveries before they are decoded
///
/// All streams handed out share one deduplicator. QoS 0 streams pass
/// through untouched since the broker never redelivers them.
pub struct Deduplicated<S> {
    inner: S,
    dedup: Arc<Mutex<MessageDeduplicator>>,
    metrics: Option<Arc<Metrics>>,
}

impl<S: Subscriber> Deduplicated<S> {
    pub fn new(inner: S, dedup: MessageDeduplicator) -> Self {
        Self {
            inner,
            dedup: Arc::new(Mutex::new(dedup)),
            metrics: None,
        }
    }

    /// Count suppressed messages in `metrics.duplicates`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl<S: Subscriber> Subscriber for Deduplicated<S> {
    async fn messages(&self, topic: &str, qos: QoS) -> Result<MessageStream> {
        let stream = self.inner.messages(topic, qos).await?;
        if qos == QoS::AtMostOnce {
            return Ok(stream);
        }

        let dedup = self.dedup.clone();
        let metrics = self.metrics.clone();
        Ok(stream
            .filter(move |msg| {
                let duplicate = dedup
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_duplicate(&msg.payload);
                if duplicate {
                    tracing::debug!(topic = %msg.topic, "Suppressed duplicate delivery");
                    if let Some(m) = &metrics {
                        Metrics::incr(&m.duplicates);
                    }
                }
                futures::future::ready(!duplicate)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryBroker;
    use crate::provider::Publisher;
    use serde_json::json;

    fn payload(event_type: &str, data: serde_json::Value) -> Vec<u8> {
        Envelope::new(event_type, data).to_bytes().unwrap().to_vec()
    }

    #[test]
    fn test_repeat_is_duplicate() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);
        let raw = payload("tts.say", json!({"text": "hi"}));

        assert!(!dedup.is_duplicate(&raw));
        assert!(dedup.is_duplicate(&raw));
    }

    #[test]
    fn test_identity_ignores_envelope_id() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);

        assert!(!dedup.is_duplicate(&payload("tts.say", json!({"text": "hi"}))));
        assert!(dedup.is_duplicate(&payload("tts.say", json!({"text": "hi"}))));
        assert!(!dedup.is_duplicate(&payload("tts.say", json!({"text": "bye"}))));
        assert!(!dedup.is_duplicate(&payload("llm.say", json!({"text": "hi"}))));
    }

    #[test]
    fn test_seq_field_wins_over_content() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);

        assert!(!dedup.is_duplicate(&payload("move", json!({"seq": 7, "angle": 10}))));
        assert!(dedup.is_duplicate(&payload("move", json!({"seq": 7, "angle": 99}))));
        assert!(!dedup.is_duplicate(&payload("move", json!({"seq": 8, "angle": 10}))));
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);
        let a = br#"{"id":"1","type":"t","source":"s","data":{"a":1,"b":{"x":1,"y":2}},"timestamp":1}"#;
        let b = br#"{"id":"2","type":"t","source":"s","data":{"b":{"y":2,"x":1},"a":1},"timestamp":2}"#;

        assert!(!dedup.is_duplicate(a));
        assert!(dedup.is_duplicate(b));
    }

    #[test]
    fn test_unparseable_fails_open() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);
        assert!(!dedup.is_duplicate(b"not json"));
        assert!(!dedup.is_duplicate(b"not json"));
        assert!(!dedup.is_duplicate(br#"{"legacy": true}"#));
        assert!(!dedup.is_duplicate(br#"{"legacy": true}"#));
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let mut dedup = MessageDeduplicator::new(Duration::from_millis(50), 100);
        let raw = payload("camera.frame", json!({"n": 1}));

        assert!(!dedup.is_duplicate(&raw));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!dedup.is_duplicate(&raw));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(60), 100);
        let envelopes: Vec<Envelope> = (0..105)
            .map(|i| Envelope::new("key", json!({"seq": format!("key_{}", i)})))
            .collect();

        for env in &envelopes {
            assert!(!dedup.check(env));
        }

        assert_eq!(dedup.len(), 100);
        for env in &envelopes[..5] {
            assert!(!dedup.contains(&Identity::of(env)));
        }
        for env in &envelopes[100..] {
            assert!(dedup.contains(&Identity::of(env)));
        }
    }

    #[test]
    fn test_disabled_never_reports() {
        let mut dedup = MessageDeduplicator::disabled();
        let raw = payload("x", json!({}));
        assert!(!dedup.is_duplicate(&raw));
        assert!(!dedup.is_duplicate(&raw));
    }

    #[tokio::test]
    async fn test_deduplicated_subscriber_filters_redeliveries() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(Metrics::new());
        let sub = Deduplicated::new(
            broker.clone(),
            MessageDeduplicator::new(Duration::from_secs(60), 10),
        )
        .with_metrics(metrics.clone());

        let mut stream = sub.messages("robot/tts", QoS::AtLeastOnce).await.unwrap();
        let first = Envelope::new("tts.say", json!({"seq": 1})).to_bytes().unwrap();
        let second = Envelope::new("tts.say", json!({"seq": 2})).to_bytes().unwrap();

        for bytes in [first.clone(), first, second] {
            broker
                .publish("robot/tts", bytes, QoS::AtLeastOnce, false)
                .await
                .unwrap();
        }

        let a = Envelope::parse(&stream.next().await.unwrap().payload).unwrap();
        let b = Envelope::parse(&stream.next().await.unwrap().payload).unwrap();
        assert_eq!(a.data()["seq"], 1);
        assert_eq!(b.data()["seq"], 2);
        assert_eq!(metrics.snapshot().duplicates, 1);
    }
}
