//! Subscription descriptors and the two-stage payload decode

use crate::ctx::Ctx;
use crate::error::{BusError, Result};
use crate::schema::{validate_as, Model};
use crate::topic::TopicRegistry;
use crate::types::{Envelope, QoS, RawMessage};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// A decoded payload with its concrete model type erased
///
/// The queue is shared by subscriptions expecting different models, so
/// payloads travel type-erased and are restored inside the owning [`Sub`].
pub type Payload = Box<dyn Any + Send>;

type DecodeFn = fn(&serde_json::Value) -> Result<Payload>;

type HandlerFn<P> = Arc<dyn Fn(Ctx<P>, Envelope, Payload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn decode_erased<T: Model>(value: &serde_json::Value) -> Result<Payload> {
    validate_as::<T>(value).map(|model| Box::new(model) as Payload)
}

/// Subscription: topic filter, expected model, handler, QoS
///
/// Built once at startup and never changed.
pub struct Sub<P = ()> {
    topic: String,
    qos: QoS,
    model: &'static str,
    decode: DecodeFn,
    handler: HandlerFn<P>,
}

impl<P: Send + Sync + 'static> Sub<P> {
    /// Subscribe `topic`, decoding payloads as `T` for `handler`
    ///
    /// ```rust
    /// use homebot_bus::{Ctx, Envelope, Sub};
    ///
    /// let sub: Sub = Sub::new("robot/speech/+", |_ctx: Ctx, env: Envelope, data: serde_json::Value| async move {
    ///     println!("{} said {}", env.source(), data);
    ///     Ok(())
    /// });
    /// assert_eq!(sub.topic(), "robot/speech/+");
    /// ```
    pub fn new<T, F, Fut>(topic: impl Into<String>, handler: F) -> Self
    where
        T: Model,
        F: Fn(Ctx<P>, Envelope, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let erased = move |ctx: Ctx<P>, envelope: Envelope, payload: Payload| -> BoxFuture<'static, Result<()>> {
            match payload.downcast::<T>() {
                Ok(model) => handler(ctx, envelope, *model).boxed(),
                Err(_) => futures::future::ready(Err(BusError::validation(
                    T::model_name(),
                    "payload does not match the subscription model",
                )))
                .boxed(),
            }
        };

        Self {
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            model: T::model_name(),
            decode: decode_erased::<T>,
            handler: Arc::new(erased),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Name of the expected payload model
    pub fn model(&self) -> &'static str {
        self.model
    }

    pub(crate) fn call(&self, ctx: Ctx<P>, envelope: Envelope, payload: Payload) -> BoxFuture<'static, Result<()>> {
        (self.handler)(ctx, envelope, payload)
    }

    /// Two-stage decode of a raw message for this subscription
    ///
    /// 1. Wire envelope whose `data` validates against the model.
    /// 2. Otherwise the whole payload validated as the model (legacy,
    ///    unwrapped producers), wrapped in a fresh envelope whose type is
    ///    resolved from the receiving topic.
    pub fn decode(&self, registry: &TopicRegistry, raw: &RawMessage) -> Decoded {
        let value: serde_json::Value = match serde_json::from_slice(&raw.payload) {
            Ok(value) => value,
            Err(e) => return Decoded::failure(FailureKind::DecodeFailed, e),
        };

        let envelope_error = match Envelope::from_value(value.clone()) {
            Ok(envelope) => match (self.decode)(envelope.data()) {
                Ok(payload) => return Decoded::Message { envelope, payload },
                Err(e) => Some(e),
            },
            Err(_) => None,
        };

        let payload = match (self.decode)(&value) {
            Ok(payload) => payload,
            Err(e) => {
                return Decoded::failure(FailureKind::ValidationFailed, envelope_error.unwrap_or(e));
            }
        };

        match registry.resolve_event(&raw.topic) {
            Ok(event_type) => Decoded::Message {
                envelope: Envelope::new(event_type, value),
                payload,
            },
            Err(e) => Decoded::failure(FailureKind::UnknownTopic, e),
        }
    }
}

/// Outcome of [`Sub::decode`]
pub enum Decoded {
    Message { envelope: Envelope, payload: Payload },
    Failure(DecodeFailure),
}

impl Decoded {
    fn failure(kind: FailureKind, reason: impl std::fmt::Display) -> Self {
        Decoded::Failure(DecodeFailure {
            kind,
            reason: reason.to_string(),
        })
    }
}

/// Why a raw message could not be turned into a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Not JSON at all
    DecodeFailed,
    /// JSON, but neither an envelope nor a bare payload matches the model
    ValidationFailed,
    /// Bare payload arrived on a topic the registry does not know
    UnknownTopic,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::DecodeFailed => "decode_failed",
            FailureKind::ValidationFailed => "validation_failed",
            FailureKind::UnknownTopic => "unknown_topic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Say {
        text: String,
    }

    impl Model for Say {}

    fn say_sub() -> Sub {
        Sub::new("robot/tts/say", |_ctx: Ctx, _env: Envelope, _say: Say| async { Ok(()) })
    }

    fn registry() -> TopicRegistry {
        TopicRegistry::new([("tts.say", "robot/tts/say")]).unwrap()
    }

    fn expect_message(decoded: Decoded) -> (Envelope, Say) {
        match decoded {
            Decoded::Message { envelope, payload } => {
                let say = payload.downcast::<Say>().expect("payload is Say");
                (envelope, *say)
            }
            Decoded::Failure(f) => panic!("unexpected failure: {:?}", f),
        }
    }

    fn expect_failure(decoded: Decoded) -> DecodeFailure {
        match decoded {
            Decoded::Failure(f) => f,
            Decoded::Message { envelope, .. } => panic!("unexpected message {}", envelope.id()),
        }
    }

    #[test]
    fn test_envelope_stage() {
        let env = Envelope::new("tts.say", json!({"text": "hi"})).with_source("llm");
        let raw = RawMessage::new("robot/tts/say", env.to_bytes().unwrap());

        let (decoded, say) = expect_message(say_sub().decode(&registry(), &raw));
        assert_eq!(decoded.id(), env.id());
        assert_eq!(decoded.source(), "llm");
        assert_eq!(say.text, "hi");
    }

    #[test]
    fn test_legacy_stage_wraps_in_fresh_envelope() {
        let raw = RawMessage::new("robot/tts/say", br#"{"text": "legacy"}"#.to_vec());

        let (envelope, say) = expect_message(say_sub().decode(&registry(), &raw));
        assert_eq!(envelope.event_type(), "tts.say");
        assert_eq!(envelope.data()["text"], "legacy");
        assert!(envelope.id().starts_with("msg-"));
        assert_eq!(say.text, "legacy");
    }

    #[test]
    fn test_undecodable_bytes() {
        let raw = RawMessage::new("robot/tts/say", b"\xff\xfe".to_vec());
        let failure = expect_failure(say_sub().decode(&registry(), &raw));
        assert_eq!(failure.kind, FailureKind::DecodeFailed);
    }

    #[test]
    fn test_wrong_shape_reports_envelope_data_error() {
        let env = Envelope::new("tts.say", json!({"volume": 3}));
        let raw = RawMessage::new("robot/tts/say", env.to_bytes().unwrap());

        let failure = expect_failure(say_sub().decode(&registry(), &raw));
        assert_eq!(failure.kind, FailureKind::ValidationFailed);
        assert!(failure.reason.contains("text"));
    }

    #[test]
    fn test_legacy_on_unmapped_topic() {
        let sub: Sub = Sub::new("robot/#", |_ctx: Ctx, _env: Envelope, _say: Say| async { Ok(()) });
        let raw = RawMessage::new("robot/other", br#"{"text": "x"}"#.to_vec());

        let failure = expect_failure(sub.decode(&registry(), &raw));
        assert_eq!(failure.kind, FailureKind::UnknownTopic);
        assert_eq!(failure.kind.as_str(), "unknown_topic");
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_validation_error() {
        use crate::metrics::Metrics;
        use crate::provider::memory::MemoryBroker;

        let ctx = Ctx::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(registry()),
            Arc::new(()),
            Arc::new(Metrics::new()),
            "test",
        );
        let env = Envelope::new("tts.say", json!({}));
        let result = say_sub().call(ctx, env, Box::new(42_u32)).await;
        assert!(matches!(result, Err(BusError::Validation { .. })));
    }
}
