//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::Status;
use crate::{MessagingError, Result};

/// Broker session abstraction used by every stage.
///
/// All operations take `&mut self`: a stage drives its session from a single
/// task, interleaving `poll` with the publishes it triggers.
#[async_trait]
pub trait Transport: Send {
    /// Publish `payload` on `topic` with at-least-once delivery.
    async fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;
    /// Subscribe to an exact topic name.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;
    /// Next session event. `None` once the session is gone for good.
    async fn poll(&mut self) -> Option<TransportEvent>;
    /// Close the session gracefully; the last-will is not triggered.
    async fn disconnect(&mut self) -> Result<()>;
    /// Client id this session is registered under.
    fn client_id(&self) -> &str;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Session lifecycle and traffic notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session. `reconnect` is set after a drop.
    Connected {
        /// Whether an earlier connection of this session existed.
        reconnect: bool,
    },
    /// A message arrived on a subscribed topic.
    Delivery(Delivery),
    /// The connection dropped; the transport keeps retrying.
    Disconnected(String),
}

/// Message the broker publishes on a client's behalf when it vanishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published on.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// Whether the will replaces the retained value.
    pub retain: bool,
}

impl LastWill {
    /// The retained `Offline` will every stage registers on its status topic.
    pub fn offline(status_topic: impl Into<String>) -> Self {
        Self {
            topic: status_topic.into(),
            payload: Bytes::from_static(Status::Offline.as_str().as_bytes()),
            retain: true,
        }
    }
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Unique client identifier.
    pub client_id: String,
    /// Optional last-will registration.
    pub last_will: Option<LastWill>,
}

impl ConnectOptions {
    /// Options with a last-will registered on `status_topic`.
    pub fn with_offline_will(client_id: impl Into<String>, status_topic: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            last_will: Some(LastWill::offline(status_topic)),
        }
    }
}

struct SessionSlot {
    token: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashSet<String>,
    will: Option<LastWill>,
}

#[derive(Default)]
struct BrokerState {
    next_token: u64,
    retained: HashMap<String, Bytes>,
    sessions: HashMap<String, SessionSlot>,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: Bytes, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.clone());
            }
        }
        for slot in self.sessions.values() {
            if slot.subscriptions.contains(topic) {
                let _ = slot.tx.send(TransportEvent::Delivery(Delivery {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                }));
            }
        }
    }

    fn fire_will(&mut self, will: Option<LastWill>) {
        if let Some(will) = will {
            debug!(topic = %will.topic, "publishing last-will");
            self.route(&will.topic, will.payload, will.retain);
        }
    }

    fn owns(&self, client_id: &str, token: u64) -> bool {
        self.sessions
            .get(client_id)
            .map(|slot| slot.token == token)
            .unwrap_or(false)
    }
}

/// In-process broker with retained messages and last-will handling.
///
/// Topics match exactly; wildcards are not supported. Delivery is immediate
/// and lossless, which makes stage behaviour deterministic under test.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. An existing session with the same id is taken over.
    pub fn connect(&self, options: ConnectOptions) -> InMemorySession {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = state.next_token;
        if let Some(previous) = state.sessions.remove(&options.client_id) {
            info!(client_id = %options.client_id, "session taken over");
            let _ = previous
                .tx
                .send(TransportEvent::Disconnected("session taken over".into()));
        }
        let _ = tx.send(TransportEvent::Connected { reconnect: false });
        state.sessions.insert(
            options.client_id.clone(),
            SessionSlot {
                token,
                tx,
                subscriptions: HashSet::new(),
                will: options.last_will,
            },
        );
        InMemorySession {
            broker: self.clone(),
            client_id: options.client_id,
            token,
            rx,
        }
    }

    /// Publish from outside any session.
    pub fn publish_raw(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        self.state.lock().route(topic, payload.into(), retain);
    }

    /// Retained payload currently held for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Whether a session is registered under `client_id`.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().sessions.contains_key(client_id)
    }

    /// Drop a client abruptly: its last-will fires and the session ends.
    pub fn kill(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.sessions.remove(client_id) {
            Some(slot) => {
                info!(client_id, "session killed");
                state.fire_will(slot.will);
                true
            }
            None => false,
        }
    }

    /// Break a client's connection and let it reconnect immediately.
    ///
    /// The last-will fires and subscriptions are cleared, as with a clean
    /// session reconnect. The client then sees `Disconnected` followed by
    /// `Connected { reconnect: true }`.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let will = match state.sessions.get_mut(client_id) {
            Some(slot) => {
                slot.subscriptions.clear();
                let _ = slot
                    .tx
                    .send(TransportEvent::Disconnected("connection severed".into()));
                let _ = slot.tx.send(TransportEvent::Connected { reconnect: true });
                slot.will.clone()
            }
            None => return false,
        };
        info!(client_id, "session severed");
        state.fire_will(will);
        true
    }
}

/// Session handle returned by [`InMemoryBroker::connect`].
pub struct InMemorySession {
    broker: InMemoryBroker,
    client_id: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl Transport for InMemorySession {
    async fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.owns(&self.client_id, self.token) {
            return Err(MessagingError::Closed);
        }
        state.route(topic, payload, retain);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        let retained = state.retained.get(topic).cloned();
        let slot = match state.sessions.get_mut(&self.client_id) {
            Some(slot) if slot.token == self.token => slot,
            _ => return Err(MessagingError::Closed),
        };
        slot.subscriptions.insert(topic.to_owned());
        if let Some(payload) = retained {
            let _ = slot.tx.send(TransportEvent::Delivery(Delivery {
                topic: topic.to_owned(),
                payload,
            }));
        }
        Ok(())
    }

    async fn poll(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.owns(&self.client_id, self.token) {
            return Err(MessagingError::Closed);
        }
        state.sessions.remove(&self.client_id);
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
