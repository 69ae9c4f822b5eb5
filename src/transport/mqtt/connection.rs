//! Pure connection configuration for the rumqttc transport
//!
//! Builds `MqttOptions` from the client's identity and session policy and maps
//! rumqttc's connection errors onto [`TransportError`].

use crate::transport::{ConnectCode, TransportError, TransportOptions};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions};
use std::time::Duration;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on how long `disconnect` waits for the DISCONNECT packet to flush
pub const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on how long `loop_stop` waits for the loop task to hand back the event loop
pub const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Username/password pair injected into every connect
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Build the rumqttc options for one connection attempt (pure function)
pub fn configure_mqtt_options(
    options: &TransportOptions,
    credentials: Option<&Credentials>,
    host: &str,
    port: u16,
    keepalive: Duration,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
    mqtt_options.set_clean_session(options.clean_session);

    // rumqttc rejects keepalives between zero and one second
    let keepalive = if keepalive.is_zero() || keepalive >= Duration::from_secs(1) {
        keepalive
    } else {
        Duration::from_secs(1)
    };
    mqtt_options.set_keep_alive(keepalive);

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options
}

/// Map a CONNACK return code onto the transport-neutral code
pub fn connect_code_from(code: ConnectReturnCode) -> ConnectCode {
    match code {
        ConnectReturnCode::Success => ConnectCode::Accepted,
        ConnectReturnCode::RefusedProtocolVersion => ConnectCode::UnacceptableProtocolVersion,
        ConnectReturnCode::BadClientId => ConnectCode::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => ConnectCode::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectCode::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnectCode::NotAuthorized,
    }
}

/// Map an event loop failure onto a transport error
pub fn transport_error_from(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::Io(e) => TransportError::Io(e),
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(connect_code_from(code)),
        other => TransportError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_options() -> TransportOptions {
        TransportOptions {
            client_id: "naila-test".to_string(),
            clean_session: false,
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(
            &transport_options(),
            None,
            "broker.local",
            1884,
            Duration::from_secs(30),
        );

        assert_eq!(options.client_id(), "naila-test");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
    }

    #[test]
    fn test_configure_mqtt_options_with_credentials() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let options = configure_mqtt_options(
            &transport_options(),
            Some(&credentials),
            "localhost",
            1883,
            Duration::from_secs(60),
        );

        assert_eq!(options.client_id(), "naila-test");
    }

    #[test]
    fn test_sub_second_keepalive_is_raised() {
        let options = configure_mqtt_options(
            &transport_options(),
            None,
            "localhost",
            1883,
            Duration::from_millis(200),
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(1));
    }

    #[test]
    fn test_connect_code_mapping() {
        assert_eq!(connect_code_from(ConnectReturnCode::Success), ConnectCode::Accepted);
        assert_eq!(
            connect_code_from(ConnectReturnCode::BadUserNamePassword),
            ConnectCode::BadCredentials
        );
        assert_eq!(
            connect_code_from(ConnectReturnCode::NotAuthorized),
            ConnectCode::NotAuthorized
        );
        assert_eq!(
            connect_code_from(ConnectReturnCode::BadClientId),
            ConnectCode::IdentifierRejected
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        let io = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(transport_error_from(io), TransportError::Io(_)));

        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(matches!(
            transport_error_from(refused),
            TransportError::Refused(ConnectCode::ServerUnavailable)
        ));

        let timeout = ConnectionError::NetworkTimeout;
        assert!(matches!(
            transport_error_from(timeout),
            TransportError::Network(_)
        ));
    }
}
