//! Per-dispatch handler context

use crate::error::Result;
use crate::metrics::Metrics;
use crate::provider::Publisher;
use crate::topic::TopicRegistry;
use crate::types::{Envelope, QoS};
use serde::Serialize;
use std::sync::Arc;

/// Options for [`Ctx::publish_with`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Id of the message this one answers
    pub correlate: Option<String>,

    /// Delivery guarantee (default at-least-once)
    pub qos: QoS,

    /// Ask the broker to retain this as the topic's last value
    pub retain: bool,
}

/// Builds a fresh [`Ctx`] for each handler invocation
pub type CtxFactory<P> = Arc<dyn Fn(&Envelope) -> Ctx<P> + Send + Sync>;

/// Everything a handler may touch: publisher, domain policy, logging span, metrics
///
/// Handlers publish by event type; topics come from the registry, so no
/// handler hardcodes a topic string.
pub struct Ctx<P = ()> {
    publisher: Arc<dyn Publisher>,
    registry: Arc<TopicRegistry>,
    policy: Arc<P>,
    metrics: Arc<Metrics>,
    source: String,
    span: tracing::Span,
}

impl<P> Clone for Ctx<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            metrics: self.metrics.clone(),
            source: self.source.clone(),
            span: self.span.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> Ctx<P> {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        registry: Arc<TopicRegistry>,
        policy: Arc<P>,
        metrics: Arc<Metrics>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            registry,
            policy,
            metrics,
            source: source.into(),
            span: tracing::Span::current(),
        }
    }

    /// Attach the span handler work is recorded under
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Factory producing one context per envelope, each with its own `dispatch` span
    pub fn factory(
        publisher: Arc<dyn Publisher>,
        registry: Arc<TopicRegistry>,
        policy: Arc<P>,
        metrics: Arc<Metrics>,
        source: impl Into<String>,
    ) -> CtxFactory<P> {
        let source = source.into();
        Arc::new(move |envelope: &Envelope| {
            let span = tracing::info_span!(
                "dispatch",
                event_type = %envelope.event_type(),
                envelope_id = %envelope.id(),
            );
            Ctx::new(
                publisher.clone(),
                registry.clone(),
                policy.clone(),
                metrics.clone(),
                source.clone(),
            )
            .with_span(span)
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Service name stamped on outgoing envelopes
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publish `data` as `event_type` at QoS 1, not retained; returns the message id
    pub async fn publish<T: Serialize + ?Sized>(&self, event_type: &str, data: &T) -> Result<String> {
        self.publish_with(event_type, data, PublishOptions::default())
            .await
    }

    /// Publish with explicit correlation, QoS and retain flag
    pub async fn publish_with<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        data: &T,
        opts: PublishOptions,
    ) -> Result<String> {
        let topic = self.registry.resolve_topic(event_type)?;

        let mut envelope =
            Envelope::new(event_type, serde_json::to_value(data)?).with_source(self.source.as_str());
        if let Some(correlate) = opts.correlate {
            envelope = envelope.correlate(correlate);
        }

        self.publisher
            .publish(topic, envelope.to_bytes()?, opts.qos, opts.retain)
            .await?;
        Metrics::incr(&self.metrics.published);

        tracing::debug!(
            parent: &self.span,
            envelope_id = %envelope.id(),
            topic = %topic,
            "Envelope published"
        );

        Ok(envelope.id().to_string())
    }
}
