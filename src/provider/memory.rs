//! In-memory broker for tests and single-process use
//!
//! Routes by MQTT-style wildcard match, keeps retained messages, and models
//! transport sessions so connection loss can be simulated.

use crate::error::{BusError, Result};
use crate::provider::{Link, MessageStream, Publisher, Session, Subscriber, Transport};
use crate::topic;
use crate::types::{QoS, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Shared in-process broker
///
/// Cloning yields another handle to the same broker. The broker implements
/// [`Publisher`] and [`Subscriber`] directly; [`MemoryTransport`] connects
/// sessions to it for use with the reconnecting client.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    online: bool,
    next_session: u64,
    connects: u64,

    /// Direct subscriptions made through `Subscriber::messages`
    routes: Vec<Route>,

    sessions: HashMap<u64, SessionEntry>,

    /// Last retained message per topic
    retained: HashMap<String, RawMessage>,

    /// Every accepted publish, in order
    log: Vec<RawMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            online: true,
            next_session: 0,
            connects: 0,
            routes: Vec::new(),
            sessions: HashMap::new(),
            retained: HashMap::new(),
            log: Vec::new(),
        }
    }
}

struct Route {
    filter: String,
    tx: mpsc::UnboundedSender<RawMessage>,
}

struct SessionEntry {
    client_id: String,
    filters: BTreeSet<String>,
    tx: mpsc::UnboundedSender<RawMessage>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the broker up or down; going down drops every session
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            state.sessions.clear();
        }
        tracing::debug!(online, "Memory broker availability changed");
    }

    /// Drop every session, as if the network blipped
    pub fn disconnect_all(&self) {
        let dropped = {
            let mut state = self.lock();
            let n = state.sessions.len();
            state.sessions.clear();
            n
        };
        tracing::debug!(sessions = dropped, "Memory broker dropped all sessions");
    }

    /// Retained message currently held for a topic
    pub fn retained(&self, topic: &str) -> Option<RawMessage> {
        self.lock().retained.get(topic).cloned()
    }

    /// Every accepted publish, oldest first
    pub fn published(&self) -> Vec<RawMessage> {
        self.lock().log.clone()
    }

    /// Publishes accepted on one topic, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<RawMessage> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Filters of the live sessions opened by a client id
    pub fn session_filters(&self, client_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut filters: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .flat_map(|s| s.filters.iter().cloned())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Number of open direct subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock().routes.iter().filter(|r| !r.tx.is_closed()).count()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of successful connects since creation
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    fn open_session(&self, client_id: &str) -> Result<(u64, MessageStream)> {
        let mut state = self.lock();
        if !state.online {
            return Err(BusError::Connection("memory broker is offline".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_session;
        state.next_session += 1;
        state.connects += 1;
        state.sessions.insert(
            id,
            SessionEntry {
                client_id: client_id.to_string(),
                filters: BTreeSet::new(),
                tx,
            },
        );

        Ok((id, UnboundedReceiverStream::new(rx).boxed()))
    }

    fn route(&self, msg: RawMessage) -> Result<()> {
        let mut state = self.lock();
        if !state.online {
            return Err(BusError::Connection("memory broker is offline".to_string()));
        }

        if msg.retain {
            if msg.payload.is_empty() {
                state.retained.remove(&msg.topic);
            } else {
                state.retained.insert(msg.topic.clone(), msg.clone());
            }
        }
        state.log.push(msg.clone());

        let live = RawMessage {
            retain: false,
            ..msg
        };

        state.routes.retain(|route| {
            if !topic::matches(&route.filter, &live.topic) {
                return true;
            }
            route.tx.send(live.clone()).is_ok()
        });

        for session in state.sessions.values() {
            if session.filters.iter().any(|f| topic::matches(f, &live.topic)) {
                let _ = session.tx.send(live.clone());
            }
        }

        Ok(())
    }

    fn retained_matching(state: &BrokerState, filter: &str) -> Vec<RawMessage> {
        let mut msgs: Vec<RawMessage> = state
            .retained
            .values()
            .filter(|m| topic::matches(filter, &m.topic))
            .cloned()
            .collect();
        msgs.sort_by(|a, b| a.topic.cmp(&b.topic));
        msgs
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        topic::validate_topic(topic)?;
        self.route(RawMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        })
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn messages(&self, filter: &str, _qos: QoS) -> Result<MessageStream> {
        topic::validate_filter(filter)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for msg in Self::retained_matching(&state, filter) {
            let _ = tx.send(msg);
        }
        state.routes.push(Route {
            filter: filter.to_string(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Transport that opens sessions on a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker, client_id: impl Into<String>) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Session> {
        let (session_id, incoming) = self.broker.open_session(&self.client_id)?;
        tracing::debug!(client_id = %self.client_id, session_id, "Memory session opened");

        Ok(Session {
            link: Arc::new(MemoryLink {
                broker: self.broker.clone(),
                session_id,
            }),
            incoming,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    session_id: u64,
}

impl MemoryLink {
    fn ensure_live(&self, state: &BrokerState) -> Result<()> {
        if state.sessions.contains_key(&self.session_id) {
            Ok(())
        } else {
            Err(BusError::Connection("memory session closed".to_string()))
        }
    }
}

#[async_trait]
impl Publisher for MemoryLink {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.ensure_live(&self.broker.lock())?;
        self.broker.publish(topic, payload, qos, retain).await
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
        topic::validate_filter(filter)?;

        let mut state = self.broker.lock();
        self.ensure_live(&state)?;

        let retained = MemoryBroker::retained_matching(&state, filter);
        if let Some(session) = state.sessions.get_mut(&self.session_id) {
            if session.filters.insert(filter.to_string()) {
                for msg in retained {
                    let _ = session.tx.send(msg);
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.lock().sessions.remove(&self.session_id);
        Ok(())
    }
}
