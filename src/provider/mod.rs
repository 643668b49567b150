//! Transport ports: the capability traits the runtime is written against
//!
//! The dispatcher only needs a [`Subscriber`]; handlers only need a
//! [`Publisher`]. The reconnecting client drives a [`Transport`], which
//! hands out one [`Session`] per successful connect.

use crate::error::Result;
use crate::types::{QoS, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

pub mod memory;
pub mod nats;

/// Stream of raw messages from the transport
pub type MessageStream = BoxStream<'static, RawMessage>;

/// Anything that can put bytes on a topic
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload to a concrete topic
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;
}

/// Anything that can hand out a message stream for a topic filter
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stream of messages whose topic matches `topic` (wildcards allowed)
    async fn messages(&self, topic: &str, qos: QoS) -> Result<MessageStream>;
}

/// One live transport connection
///
/// A link knows nothing about earlier sessions: subscriptions must be
/// re-issued after every connect.
#[async_trait]
pub trait Link: Publisher {
    /// Ask the broker to route a topic filter to this session
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Close the connection; the session's incoming stream ends
    async fn disconnect(&self) -> Result<()>;
}

/// A connected session: a link for outbound calls plus every inbound message
///
/// `incoming` ends when the connection is lost.
pub struct Session {
    pub link: Arc<dyn Link>,
    pub incoming: MessageStream,
}

/// Connection factory for a concrete broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session; failures are `BusError::Connection`
    async fn connect(&self) -> Result<Session>;

    /// Transport name (e.g., "memory", "nats")
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        (**self).publish(topic, payload, qos, retain).await
    }
}

#[async_trait]
impl<T: Subscriber + ?Sized> Subscriber for Arc<T> {
    async fn messages(&self, topic: &str, qos: QoS) -> Result<MessageStream> {
        (**self).messages(topic, qos).await
    }
}
