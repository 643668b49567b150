//! NATS sessions: connect, publish, subscribe, detect loss

use super::config::{to_subject, to_topic, NatsConfig};
use crate::error::{BusError, Result};
use crate::provider::{Link, Publisher, Session, Transport};
use crate::topic;
use crate::types::{QoS, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Transport opening one `async-nats` connection per session
///
/// The library reconnects on its own, but a disconnect still ends the
/// session here so the reconnecting client re-runs its resubscribe and
/// health sequence against a fresh connection.
pub struct NatsTransport {
    config: Arc<NatsConfig>,
}

impl NatsTransport {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<Session> {
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);

        let callback_tx = lost_tx.clone();
        let client = build_connect_options(&self.config)
            .event_callback(move |event| {
                let lost = callback_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            lost.send_replace(true);
                        }
                        other => tracing::debug!(event = ?other, "NATS connection event"),
                    }
                }
            })
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", self.config.url, e)))?;

        tracing::info!(url = %self.config.url, client_id = %self.config.client_id, "Connected to NATS");

        let (tx, rx) = mpsc::unbounded_channel();
        let incoming = UnboundedReceiverStream::new(rx)
            .take_until(async move {
                let _ = lost_rx.wait_for(|lost| *lost).await;
            })
            .boxed();

        Ok(Session {
            link: Arc::new(NatsLink {
                client,
                tx,
                lost: lost_tx,
                tasks: Mutex::new(Vec::new()),
            }),
            incoming,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct NatsLink {
    client: async_nats::Client,
    tx: mpsc::UnboundedSender<RawMessage>,
    lost: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl NatsLink {
    /// A failure on a lost connection ends the session instead of being
    /// reported against one topic
    fn classify(&self, err: BusError) -> BusError {
        let connected = matches!(self.client.connection_state(), async_nats::connection::State::Connected);
        if *self.lost.borrow() || !connected {
            BusError::Connection(err.to_string())
        } else {
            err
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if *self.lost.borrow() {
            return Err(BusError::Connection("NATS session ended".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for NatsLink {
    /// Core NATS has no retained store; `retain` publishes are sent as
    /// ordinary messages and QoS is not negotiated per message.
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, retain: bool) -> Result<()> {
        topic::validate_topic(topic)?;
        self.ensure_live()?;
        let subject = to_subject(topic);

        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| {
                self.classify(BusError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            })?;

        tracing::trace!(subject = %subject, retain, "Published to NATS");
        Ok(())
    }
}

#[async_trait]
impl Link for NatsLink {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        topic::validate_filter(filter)?;
        self.ensure_live()?;
        let subject = to_subject(filter);

        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| {
                self.classify(BusError::Subscribe {
                    topic: filter.to_string(),
                    reason: e.to_string(),
                })
            })?;

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let raw = RawMessage {
                    topic: to_topic(msg.subject.as_str()),
                    payload: msg.payload,
                    qos,
                    retain: false,
                };
                if tx.send(raw).is_err() {
                    break;
                }
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.abort_handle());

        tracing::debug!(subject = %subject, "Subscribed to NATS subject");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let tasks: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.lost.send_replace(true);

        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("flush on disconnect failed: {}", e)))
    }
}

fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .name(config.client_id.as_str())
        .ping_interval(Duration::from_secs(config.keepalive_secs.max(1)))
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}
