//! Transport boundary for the managed client
//!
//! The managed client never speaks MQTT itself. It drives a [`Transport`]
//! (connect, background loop, subscribe, publish, disconnect) and consumes the
//! [`TransportEvent`]s the transport pushes onto a channel from its own task.
//! [`mqtt::RumqttTransport`] is the production implementation; tests use
//! [`crate::testing::MockTransport`].

use bytes::Bytes;
use rumqttc::QoS;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Channel the transport's background loop pushes events into
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Identity and session policy a transport handle is created with
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub client_id: String,
    pub clean_session: bool,
}

/// Transport capability set consumed by the managed client
///
/// Every method except `set_credentials` takes `&self`: the handle is shared
/// between the caller and the event reaction task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Configure username/password for subsequent connects
    fn set_credentials(&mut self, username: &str, password: &str);

    /// Open the network connection.
    ///
    /// Implementations may return as soon as the socket is open, or only after
    /// the broker answered (the rumqttc transport waits for the CONNACK and
    /// maps a refusal to [`TransportError::Refused`]). Either way an accepted
    /// acknowledgment is reported as a [`TransportEvent::ConnAck`] once
    /// [`Transport::loop_start`] runs, so callers react to it in one place.
    async fn connect(&self, host: &str, port: u16, keepalive: Duration)
        -> Result<(), TransportError>;

    /// Start the background network loop, delivering events to `events`
    async fn loop_start(&self, events: EventSender) -> Result<(), TransportError>;

    /// Stop the background network loop. Idempotent.
    async fn loop_stop(&self);

    /// Close the connection to the broker
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS)
        -> Result<(), TransportError>;
}

/// Events reported by the transport, in wire order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker answered the connect request
    ConnAck {
        code: ConnectCode,
        session_present: bool,
    },
    /// Link went away without the caller asking for it
    Disconnected { reason: DisconnectReason },
    /// Application message on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Subscription acknowledged; `None` marks a rejected filter
    SubAck {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// Publish completed (PUBACK for QoS 1, PUBCOMP for QoS 2)
    PubAck { packet_id: u16 },
}

/// MQTT 3.1.1 CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectCode {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectCode::Accepted)
    }

    /// Numeric return code as carried in the CONNACK packet
    pub fn code(&self) -> u8 {
        match self {
            ConnectCode::Accepted => 0,
            ConnectCode::UnacceptableProtocolVersion => 1,
            ConnectCode::IdentifierRejected => 2,
            ConnectCode::ServerUnavailable => 3,
            ConnectCode::BadCredentials => 4,
            ConnectCode::NotAuthorized => 5,
        }
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectCode::Accepted => "connection accepted",
            ConnectCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectCode::IdentifierRejected => "client identifier rejected",
            ConnectCode::ServerUnavailable => "server unavailable",
            ConnectCode::BadCredentials => "bad username or password",
            ConnectCode::NotAuthorized => "not authorized",
        };
        write!(f, "{text} (code {})", self.code())
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The caller asked for it
    ClientInitiated,
    /// Broker sent DISCONNECT or closed the session
    BrokerInitiated,
    /// Network failure or keepalive expiry
    ConnectionLost(String),
    /// Broker refused the connect request
    Refused(ConnectCode),
}

impl DisconnectReason {
    /// True for drops the caller did not request and the broker did not refuse
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            DisconnectReason::BrokerInitiated | DisconnectReason::ConnectionLost(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientInitiated => write!(f, "client disconnected"),
            DisconnectReason::BrokerInitiated => write!(f, "broker disconnected"),
            DisconnectReason::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
            DisconnectReason::Refused(code) => write!(f, "connection refused: {code}"),
        }
    }
}

/// Errors surfaced by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection refused by broker: {0}")]
    Refused(ConnectCode),
    #[error("Request rejected by transport")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Transport not started: {0}")]
    NotStarted(String),
}

impl TransportError {
    pub fn request<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TransportError::Request(Box::new(error))
    }
}
