//! Session state shared between the caller and the event reaction task

use super::health_monitor::HealthMonitor;
use crate::observability::{ClientEvent, EventBus};
use crate::transport::DisconnectReason;
use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

/// Callback invoked with `(topic, payload)` for every inbound message
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Connection state of a managed client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No transport handle yet
    Uninitialized,
    /// Transport handle created, never connected
    Initialized,
    /// Connect issued, waiting for the broker's acknowledgment
    Connecting,
    Connected,
    /// Waiting to make automatic reconnection attempt `attempt`
    Reconnecting { attempt: u32 },
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connect in flight, either caller-issued or automatic
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "uninitialized"),
            ConnectionState::Initialized => write!(f, "initialized"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
        }
    }
}

/// One entry of the desired subscription list
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Result of a subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Recorded; will be issued on the next accepted connect
    Queued,
    /// Recorded and sent to the broker; the SubAck arrives as a client event
    Requested,
}

/// Everything guarded by the session lock
#[derive(Debug)]
pub(crate) struct Session {
    pub state: ConnectionState,
    /// Append-only, replayed in order on every accepted ConnAck
    pub subscriptions: Vec<Subscription>,
    pub reconnect_attempts: u32,
}

pub(crate) struct ClientState {
    pub session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
    handler: RwLock<Option<MessageCallback>>,
    events: EventBus,
}

impl ClientState {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            session: Mutex::new(Session {
                state: ConnectionState::Uninitialized,
                subscriptions: Vec::new(),
                reconnect_attempts: 0,
            }),
            state_tx,
            handler: RwLock::new(None),
            events: EventBus::new(),
        }
    }

    /// Move the session to `next`, mirroring it on the watch channel
    pub fn transition(&self, session: &mut Session, next: ConnectionState) {
        if session.state == next {
            return;
        }
        HealthMonitor::log_state_transition(&session.state, &next);
        session.state = next.clone();
        self.state_tx.send_replace(next);
    }

    pub fn current(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        self.events.emit(event);
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn set_handler(&self, handler: Option<MessageCallback>) {
        *self.handler.write().await = handler;
    }

    pub async fn handler(&self) -> Option<MessageCallback> {
        self.handler.read().await.clone()
    }
}
