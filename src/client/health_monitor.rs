//! Pure connection-state and reconnection decisions
//!
//! Nothing here touches the transport. The caller-facing operations and the
//! event reaction task both ask these functions what the next state is, so
//! the state machine lives in one place.

use super::state::ConnectionState;
use crate::config::ReconnectPolicy;
use crate::transport::{ConnectCode, DisconnectReason};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Slack added on top of the worst-case reconnection delay when waiting for a connect
const CONFIRMATION_BUFFER: Duration = Duration::from_secs(10);

pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !policy.is_enabled() || current_attempts >= policy.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: policy.backoff_delay_ms(attempt),
        }
    }

    /// How long a caller should wait for a connect to be confirmed (pure function)
    pub fn calculate_connection_timeout(keepalive: Duration, policy: &ReconnectPolicy) -> Duration {
        let base = keepalive.max(Duration::from_secs(1)) + CONFIRMATION_BUFFER;
        if policy.is_enabled() {
            base + Duration::from_millis(policy.max_total_delay_ms())
        } else {
            base
        }
    }

    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        current: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        let client_disconnected = matches!(
            current,
            ConnectionState::Disconnected(DisconnectReason::ClientInitiated)
        );

        match event {
            ConnectionEvent::SetupCompleted => match current {
                ConnectionState::Uninitialized => ConnectionState::Initialized,
                other => other.clone(),
            },
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            // A late acknowledgment must not undo a caller's disconnect
            ConnectionEvent::ConnAckReceived(_) if client_disconnected => current.clone(),
            ConnectionEvent::ConnAckReceived(code) if code.is_accepted() => {
                ConnectionState::Connected
            }
            ConnectionEvent::ConnAckReceived(code) => {
                ConnectionState::Disconnected(DisconnectReason::Refused(code))
            }
            ConnectionEvent::Disconnected(_) if client_disconnected => current.clone(),
            ConnectionEvent::Disconnected(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::ReconnectionScheduled(_) if client_disconnected => current.clone(),
            ConnectionEvent::ReconnectionScheduled(attempt) => {
                ConnectionState::Reconnecting { attempt }
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Check if a subscribe should go to the broker right away (pure function)
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason))
                if reason.is_unexpected() =>
            {
                warn!("MQTT connection lost: {}", reason);
            }
            (_, ConnectionState::Disconnected(DisconnectReason::Refused(code))) => {
                error!("MQTT connection refused: {}", code);
            }
            (_, ConnectionState::Reconnecting { attempt }) => {
                info!("Scheduling reconnection attempt {}", attempt);
            }
            _ => {
                debug!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - policy disabled or attempts used up
    AbortMaxAttemptsExceeded,
}

/// Events that drive connection state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport handle created
    SetupCompleted,
    /// Caller or reconnection logic issued a connect
    ConnectRequested,
    /// Broker answered the connect
    ConnAckReceived(ConnectCode),
    /// Link ended
    Disconnected(DisconnectReason),
    /// Reconnection attempt `n` scheduled
    ReconnectionScheduled(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn test_should_attempt_reconnection_proceeds() {
        let decision = HealthMonitor::should_attempt_reconnection(0, &enabled_policy(3), false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(2, &enabled_policy(3), false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 400
            }
        );
    }

    #[test]
    fn test_should_attempt_reconnection_limits() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &enabled_policy(3), false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &ReconnectPolicy::default(), false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &enabled_policy(3), true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_connection_timeout() {
        let keepalive = Duration::from_secs(60);
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(keepalive, &ReconnectPolicy::default()),
            Duration::from_secs(70)
        );

        let policy = enabled_policy(2);
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(keepalive, &policy),
            Duration::from_secs(70) + Duration::from_millis(policy.max_total_delay_ms())
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        let state = ConnectionState::Uninitialized;
        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::SetupCompleted);
        assert_eq!(state, ConnectionState::Initialized);

        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::ConnectRequested);
        assert_eq!(state, ConnectionState::Connecting);

        let state = HealthMonitor::determine_next_state(
            &state,
            ConnectionEvent::ConnAckReceived(ConnectCode::Accepted),
        );
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn test_setup_does_not_reset_state() {
        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            ConnectionEvent::SetupCompleted,
        );
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn test_refused_connack() {
        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived(ConnectCode::NotAuthorized),
        );
        assert_eq!(
            state,
            ConnectionState::Disconnected(DisconnectReason::Refused(ConnectCode::NotAuthorized))
        );
    }

    #[test]
    fn test_client_disconnect_is_sticky() {
        let current = ConnectionState::Disconnected(DisconnectReason::ClientInitiated);

        for event in [
            ConnectionEvent::ConnAckReceived(ConnectCode::Accepted),
            ConnectionEvent::Disconnected(DisconnectReason::BrokerInitiated),
            ConnectionEvent::ReconnectionScheduled(1),
        ] {
            assert_eq!(
                HealthMonitor::determine_next_state(&current, event),
                current
            );
        }

        // Only an explicit connect leaves the client-initiated state
        assert_eq!(
            HealthMonitor::determine_next_state(&current, ConnectionEvent::ConnectRequested),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_unexpected_disconnect_and_reconnect() {
        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            ConnectionEvent::Disconnected(DisconnectReason::ConnectionLost("reset".to_string())),
        );
        assert!(matches!(
            state,
            ConnectionState::Disconnected(DisconnectReason::ConnectionLost(_))
        ));

        let state =
            HealthMonitor::determine_next_state(&state, ConnectionEvent::ReconnectionScheduled(1));
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn test_can_publish_and_subscribe() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Initialized));
        assert!(HealthMonitor::can_subscribe(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_subscribe(&ConnectionState::Reconnecting {
            attempt: 1
        }));
    }
}
