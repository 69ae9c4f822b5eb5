//! Error types for managed client operations
//!
//! Configuration and transport failures have their own enums next to the code
//! that raises them ([`crate::config::ConfigError`],
//! [`crate::transport::TransportError`]); this module holds the errors callers
//! of [`crate::ManagedClient`] see.

use crate::client::ConnectionState;
use crate::transport::{ConnectCode, DisconnectReason, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Failure to establish (or confirm) a broker connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Could not reach broker at {host}:{port}: {source}")]
    Socket {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("Broker rejected connection: {0}")]
    Rejected(ConnectCode),

    #[error("Client is already connected or connecting")]
    AlreadyConnected,

    #[error("Connection ended before it was confirmed: {0}")]
    Aborted(DisconnectReason),

    #[error("No broker acknowledgment within {0:?}")]
    Timeout(Duration),
}

/// Main error type for managed client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("Invalid topic: {message}")]
    InvalidTopic { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Create not-connected error
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Create invalid topic error
    pub fn invalid_topic<S: Into<String>>(message: S) -> Self {
        Self::InvalidTopic {
            message: message.into(),
        }
    }

    /// True when the broker refused the connect request
    pub fn is_rejected(&self) -> bool {
        matches!(self, ClientError::Connect(ConnectError::Rejected(_)))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_error_creation() {
        let error = ClientError::invalid_topic("topic must not be empty");
        assert!(matches!(error, ClientError::InvalidTopic { .. }));

        let error = ClientError::not_connected(ConnectionState::Initialized);
        assert!(matches!(
            error,
            ClientError::NotConnected {
                state: ConnectionState::Initialized
            }
        ));
    }

    #[test]
    fn test_error_display() {
        let error = ClientError::not_connected(ConnectionState::Disconnected(
            DisconnectReason::ClientInitiated,
        ));
        assert!(error.to_string().starts_with("Not connected"));

        let error = ConnectError::Rejected(ConnectCode::BadCredentials);
        assert_eq!(
            error.to_string(),
            "Broker rejected connection: bad username or password (code 4)"
        );

        let error = ConnectError::Socket {
            host: "broker.local".to_string(),
            port: 1883,
            source: TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )),
        };
        assert!(error.to_string().contains("broker.local:1883"));
    }

    #[test]
    fn test_error_conversions() {
        let config_error = ConfigError::InvalidConfig("empty host".to_string());
        let client_error: ClientError = config_error.into();
        assert!(matches!(client_error, ClientError::Configuration(_)));

        let client_error: ClientError = ConnectError::Rejected(ConnectCode::NotAuthorized).into();
        assert!(client_error.is_rejected());

        let client_error: ClientError = TransportError::Network("reset".to_string()).into();
        assert!(matches!(client_error, ClientError::Transport(_)));
        assert!(!client_error.is_rejected());
    }
}
