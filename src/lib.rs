//! # homebot-bus
//!
//! Messaging runtime shared by every home-robot service: a typed envelope,
//! a topic registry, a backpressure-aware dispatcher, message deduplication
//! and an auto-reconnecting transport client.
//!
//! ## Quick Start
//!
//! ```rust
//! use homebot_bus::provider::memory::MemoryBroker;
//! use homebot_bus::{Ctx, DispatchOptions, Dispatcher, Envelope, Metrics, Sub, TopicRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> homebot_bus::Result<()> {
//! let broker = MemoryBroker::new();
//! let registry = Arc::new(TopicRegistry::new([
//!     ("speech.transcript", "robot/speech/transcript"),
//!     ("tts.say", "robot/tts/say"),
//! ])?);
//! let metrics = Arc::new(Metrics::new());
//!
//! // Echo every transcript back through the speaker
//! let subs = vec![Sub::new(
//!     "robot/speech/transcript",
//!     |ctx: Ctx, env: Envelope, data: serde_json::Value| async move {
//!         ctx.publish("tts.say", &serde_json::json!({ "text": data["text"] }))
//!             .await
//!             .map(|_| ())
//!             .map_err(|e| homebot_bus::BusError::handler(format!("{} failed: {}", env.id(), e)))
//!     },
//! )];
//!
//! let factory = Ctx::factory(
//!     Arc::new(broker.clone()),
//!     registry.clone(),
//!     Arc::new(()),
//!     metrics.clone(),
//!     "echo",
//! );
//! let dispatcher = Dispatcher::new(
//!     Arc::new(broker),
//!     registry,
//!     subs,
//!     factory,
//!     metrics,
//!     DispatchOptions::default(),
//! )?;
//! dispatcher.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory**: in-process broker for tests and single-process use
//! - **nats**: `async-nats` adapter
//!
//! ## Architecture
//!
//! - **Publisher / Subscriber**: capability traits handlers and the
//!   dispatcher are written against
//! - **Transport / Link**: session factory driven by [`ReconnectingClient`]
//! - **Dispatcher**: per-subscription pumps, one bounded queue, a worker pool
//! - **Deduplicated**: subscriber wrapper suppressing broker redeliveries

pub mod client;
pub mod config;
pub mod ctx;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod schema;
pub mod topic;
pub mod types;

// Re-export core types
pub use client::{Backoff, ClientOptions, ConnectionState, ReconnectingClient};
pub use config::BusConfig;
pub use ctx::{Ctx, CtxFactory, PublishOptions};
pub use dedup::{Deduplicated, Identity, MessageDeduplicator};
pub use dispatch::{
    DecodeFailure, Decoded, DispatchOptions, Dispatcher, FailureKind, OverflowStrategy, Payload, Sub,
};
pub use error::{BusError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use provider::{Link, MessageStream, Publisher, Session, Subscriber, Transport};
pub use schema::{validate_as, Model};
pub use topic::TopicRegistry;
pub use types::{Envelope, HealthEvent, HealthReport, QoS, RawMessage};

// Re-export transports for convenience
pub use provider::memory::{MemoryBroker, MemoryTransport};
pub use provider::nats::{NatsConfig, NatsTransport};
