//! NATS transport
//!
//! Maps slash-separated topics onto NATS subjects and exposes each
//! connection as a [`Session`](crate::provider::Session) for the
//! reconnecting client.

mod config;
mod transport;

pub use config::{to_subject, to_topic, NatsConfig};
pub use transport::NatsTransport;
