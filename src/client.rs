//! Reconnecting client: keeps one transport session alive for the process
//!
//! The client owns the set of tracked topics. Every new session gets all of
//! them re-subscribed and a retained health report published before any
//! incoming message is routed, so downstream consumers see the service come
//! back before they see its traffic.

use crate::error::{BusError, Result};
use crate::provider::{Link, MessageStream, Publisher, Session, Subscriber, Transport};
use crate::topic::{self, health_topic, keepalive_topic};
use crate::types::{HealthEvent, HealthReport, QoS, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;

/// Client tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Name used in health and keepalive topics
    pub service_id: String,

    /// First delay after a failed connect
    pub reconnect_min_delay: Duration,

    /// Ceiling for the doubling backoff
    pub reconnect_max_delay: Duration,

    /// Publish retained health reports on connect, disconnect and shutdown
    pub health: bool,

    /// Publish periodic keepalives while connected
    pub heartbeat: bool,

    pub heartbeat_interval: Duration,

    /// Buffer of each local subscription stream; a full stream drops new
    /// messages instead of holding up the others
    pub route_capacity: usize,
}

impl ClientOptions {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            ..Default::default()
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            service_id: "homebot".to_string(),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            health: true,
            heartbeat: false,
            heartbeat_interval: Duration::from_secs(10),
            route_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Doubling delay between connection attempts, capped and resettable
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay to wait now; the following call returns double, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

struct Route {
    filter: String,
    tx: mpsc::Sender<RawMessage>,
}

/// Auto-reconnecting [`Publisher`] and [`Subscriber`] over a [`Transport`]
///
/// Share it behind an `Arc`: one task drives [`ReconnectingClient::run`]
/// while handlers publish and the dispatcher subscribes through the same
/// instance.
pub struct ReconnectingClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<dyn Link>>>,
    topics: RwLock<BTreeMap<String, QoS>>,
    routes: Mutex<Vec<Route>>,
    sessions: AtomicU64,
    route_overflows: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ReconnectingClient {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            state: watch::channel(ConnectionState::Disconnected).0,
            link: RwLock::new(None),
            topics: RwLock::new(BTreeMap::new()),
            routes: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
            route_overflows: AtomicU64::new(0),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every topic filter subscribed so far, with its QoS
    pub fn tracked_topics(&self) -> Vec<(String, QoS)> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(t, q)| (t.clone(), *q))
            .collect()
    }

    /// Sessions established since creation
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Messages dropped because a local subscription stream was full
    pub fn route_overflow_count(&self) -> u64 {
        self.route_overflows.load(Ordering::Relaxed)
    }

    /// Keep a session alive until [`ReconnectingClient::shutdown`]
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.shutdown.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        tracing::info!(
            service_id = %self.options.service_id,
            transport = self.transport.name(),
            "Reconnecting client started"
        );

        tokio::select! {
            _ = self.connection_loop() => {}
            _ = self.heartbeat_loop() => {}
            _ = stop.wait_for(|stopped| *stopped) => {}
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!(service_id = %self.options.service_id, "Reconnecting client stopped");
        Ok(())
    }

    /// Publish the final `stopped` report, close the session and end `run`
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        let link = self.take_link();
        if let Some(link) = link {
            self.report_stopped(&link, None).await;
            link.disconnect().await?;
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn connection_loop(&self) {
        let mut backoff = Backoff::new(self.options.reconnect_min_delay, self.options.reconnect_max_delay);

        loop {
            self.set_state(ConnectionState::Connecting);

            match self.transport.connect().await {
                Ok(session) => {
                    backoff.reset();
                    self.serve(session).await;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::warn!(
                        transport = self.transport.name(),
                        error = %e,
                        "Connect failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn serve(&self, session: Session) {
        let Session { link, mut incoming } = session;

        // Snapshot and install under the topics lock so a concurrent
        // `messages()` either lands in the snapshot or sees the new link.
        let topics = {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link.clone());
            let snapshot: Vec<(String, QoS)> = topics.iter().map(|(t, q)| (t.clone(), *q)).collect();
            snapshot
        };

        for (filter, qos) in &topics {
            if let Err(e) = link.subscribe(filter, *qos).await {
                tracing::warn!(topic = %filter, error = %e, "Resubscribe failed");
                if e.is_connection() {
                    self.end_session(&link, Some(e.to_string())).await;
                    return;
                }
            }
        }

        let previous = self.sessions.fetch_add(1, Ordering::Relaxed);
        let event = if previous == 0 {
            HealthEvent::Ready
        } else {
            HealthEvent::Reconnected
        };
        if self.options.health {
            self.publish_health(&link, &HealthReport::up(event)).await;
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(
            service_id = %self.options.service_id,
            resubscribed = topics.len(),
            event = ?event,
            "Session established"
        );

        while let Some(msg) = incoming.next().await {
            self.route(msg);
        }

        self.end_session(&link, Some("connection lost".to_string())).await;
    }

    async fn end_session(&self, link: &Arc<dyn Link>, err: Option<String>) {
        {
            let mut current = self.link.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|l| Arc::ptr_eq(l, link)) {
                *current = None;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::warn!(
            service_id = %self.options.service_id,
            reason = err.as_deref().unwrap_or("unknown"),
            "Session ended"
        );
        self.report_stopped(link, err).await;
        if let Err(e) = link.disconnect().await {
            tracing::debug!(error = %e, "Closing lost session failed");
        }
    }

    async fn heartbeat_loop(&self) {
        if !self.options.heartbeat {
            return futures::future::pending().await;
        }

        let topic = keepalive_topic(&self.options.service_id);
        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.state() != ConnectionState::Connected {
                continue;
            }
            let Some(link) = self.current_link() else {
                continue;
            };

            let result = match HealthReport::heartbeat().to_bytes() {
                Ok(payload) => link.publish(&topic, payload, QoS::AtMostOnce, false).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(topic = %topic, error = %e, "Heartbeat not sent");
            }
        }
    }

    fn route(&self, msg: RawMessage) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|route| {
            if !topic::matches(&route.filter, &msg.topic) {
                return !route.tx.is_closed();
            }
            match route.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.route_overflows.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        topic = %msg.topic,
                        filter = %route.filter,
                        "route_overflow: local subscription full, message dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    async fn publish_health(&self, link: &Arc<dyn Link>, report: &HealthReport) {
        let topic = health_topic(&self.options.service_id);
        let result = match report.to_bytes() {
            Ok(payload) => link.publish(&topic, payload, QoS::AtLeastOnce, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!(topic = %topic, event = ?report.event, error = %e, "Health report not sent");
        }
    }

    /// Best effort: the link is usually already gone
    async fn report_stopped(&self, link: &Arc<dyn Link>, err: Option<String>) {
        if self.options.health {
            self.publish_health(link, &HealthReport::stopped(err)).await;
        }
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_link(&self) -> Option<Arc<dyn Link>> {
        self.link.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }
}

#[async_trait]
impl Publisher for ReconnectingClient {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        let link = self
            .current_link()
            .ok_or_else(|| BusError::Connection("not connected".to_string()))?;
        link.publish(topic, payload, qos, retain).await
    }
}

#[async_trait]
impl Subscriber for ReconnectingClient {
    async fn messages(&self, filter: &str, qos: QoS) -> Result<MessageStream> {
        topic::validate_filter(filter)?;

        let (tx, rx) = mpsc::channel(self.options.route_capacity.max(1));
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                filter: filter.to_string(),
                tx: tx.clone(),
            });

        let (is_new, link) = {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let is_new = topics.insert(filter.to_string(), qos).is_none();
            (is_new, self.current_link())
        };

        if let (true, Some(link)) = (is_new, link) {
            if let Err(e) = link.subscribe(filter, qos).await {
                if !e.is_connection() {
                    self.forget(filter, &tx, is_new);
                    return Err(BusError::Subscribe {
                        topic: filter.to_string(),
                        reason: e.to_string(),
                    });
                }
                tracing::debug!(topic = %filter, error = %e, "Subscribe deferred to next session");
            }
        }

        tracing::debug!(topic = %filter, tracked = is_new, "Local subscription added");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

impl ReconnectingClient {
    /// Undo a rejected `messages()` call so later sessions don't retry it
    fn forget(&self, filter: &str, tx: &mpsc::Sender<RawMessage>, tracked: bool) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| !r.tx.same_channel(tx));
        if tracked {
            self.topics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(filter);
        }
    }
}
