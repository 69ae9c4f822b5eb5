//! Dedicated task reacting to transport events
//!
//! The transport pushes [`TransportEvent`]s onto an unbounded channel from its
//! own network task. [`EventReactions::run`] consumes them one at a time, in
//! arrival order, so a subscription replay can never interleave with another
//! reaction.

use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::state::{ClientState, ConnectionState, Session};
use crate::config::{qos_level, MqttConfig};
use crate::observability::ClientEvent;
use crate::transport::mqtt::MessageHandler;
use crate::transport::{
    ConnectCode, DisconnectReason, EventSender, Transport, TransportError, TransportEvent,
};
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

pub(crate) struct EventReactions<T: Transport> {
    state: Arc<ClientState>,
    transport: Arc<T>,
    config: Arc<MqttConfig>,
    /// Handed to `loop_start` on automatic reconnection
    event_tx: EventSender,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> EventReactions<T> {
    pub(crate) fn new(
        state: Arc<ClientState>,
        transport: Arc<T>,
        config: Arc<MqttConfig>,
        event_tx: EventSender,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            transport,
            config,
            event_tx,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let span = crate::lifecycle_span!(task = "event_reactions", client_id = %self.config.client_id);

        async move {
            debug!("Event reaction task started");

            loop {
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            debug!("Event reaction task received shutdown signal");
                            break;
                        }
                    }

                    event = events.recv() => {
                        match event {
                            Some(event) => self.handle_event(event).await,
                            None => {
                                debug!("Transport event channel closed");
                                break;
                            }
                        }
                    }
                }
            }

            debug!("Event reaction task stopped");
        }
        .instrument(span)
        .await
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck {
                code,
                session_present,
            } => self.on_conn_ack(code, session_present).await,
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason).await,
            TransportEvent::Message { topic, payload } => self.on_message(&topic, &payload).await,
            TransportEvent::SubAck { packet_id, granted } => self.on_sub_ack(packet_id, granted),
            TransportEvent::PubAck { packet_id } => {
                debug!(packet_id = packet_id, "Publish acknowledged");
                self.state
                    .emit(ClientEvent::PublishAcknowledged { packet_id });
            }
        }
    }

    async fn on_conn_ack(&self, code: ConnectCode, session_present: bool) {
        let mut session = self.state.session.lock().await;
        let next = HealthMonitor::determine_next_state(
            &session.state,
            ConnectionEvent::ConnAckReceived(code),
        );

        if !code.is_accepted() {
            self.state.transition(&mut session, next);
            drop(session);

            self.transport.loop_stop().await;
            self.state.emit(ClientEvent::ConnectionRefused(code));
            return;
        }

        if !next.is_connected() {
            drop(session);
            // A connect that raced the caller's disconnect; close the link it opened
            debug!("Closing connection acknowledged after client disconnect");
            self.transport.loop_stop().await;
            if let Err(e) = self.transport.disconnect().await {
                debug!(error = %e, "Failed to close stale connection");
            }
            return;
        }

        // Replay under the session lock so concurrent subscribes land exactly once
        let replayed = self.replay_subscriptions(&session).await;
        session.reconnect_attempts = 0;
        self.state.transition(&mut session, next);
        drop(session);

        info!(
            session_present = session_present,
            replayed = replayed,
            "Connected to MQTT broker"
        );
        self.state.emit(ClientEvent::Connected {
            session_present,
            replayed,
        });
    }

    /// Issue one transport subscribe per desired subscription, in insertion order
    async fn replay_subscriptions(&self, session: &Session) -> usize {
        for subscription in &session.subscriptions {
            match self
                .transport
                .subscribe(&subscription.topic, subscription.qos)
                .await
            {
                Ok(()) => debug!(
                    topic = %subscription.topic,
                    qos = qos_level(subscription.qos),
                    "Replayed subscription"
                ),
                Err(e) => error!(
                    topic = %subscription.topic,
                    error = %e,
                    "Failed to replay subscription"
                ),
            }
        }
        session.subscriptions.len()
    }

    async fn on_disconnected(&mut self, reason: DisconnectReason) {
        let mut session = self.state.session.lock().await;
        if matches!(
            session.state,
            ConnectionState::Disconnected(DisconnectReason::ClientInitiated)
        ) {
            debug!(reason = %reason, "Ignoring transport disconnect after client disconnect");
            return;
        }

        let next = HealthMonitor::determine_next_state(
            &session.state,
            ConnectionEvent::Disconnected(reason.clone()),
        );
        self.state.transition(&mut session, next);
        drop(session);

        self.state.emit(ClientEvent::Disconnected(reason.clone()));

        if reason.is_unexpected() && self.config.reconnect.is_enabled() {
            self.reconnect(reason).await;
        }
    }

    /// Bounded reconnection after an unexpected drop.
    ///
    /// Returns once a connect has been issued (its ConnAck arrives as a later
    /// event), the policy gives up, or the client disconnects or shuts down.
    async fn reconnect(&mut self, mut last_reason: DisconnectReason) {
        loop {
            let attempts = self.state.session.lock().await.reconnect_attempts;
            let shutdown_requested = *self.shutdown_rx.borrow();

            let (attempt, delay_ms) = match HealthMonitor::should_attempt_reconnection(
                attempts,
                &self.config.reconnect,
                shutdown_requested,
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => (attempt, delay_ms),
                ReconnectionDecision::AbortShutdownRequested => {
                    debug!("Shutdown requested, not reconnecting");
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    self.abandon_reconnection(attempts, last_reason).await;
                    return;
                }
            };

            {
                let mut session = self.state.session.lock().await;
                if Self::client_disconnected(&session) {
                    return;
                }
                session.reconnect_attempts = attempt;
                let next = HealthMonitor::determine_next_state(
                    &session.state,
                    ConnectionEvent::ReconnectionScheduled(attempt),
                );
                self.state.transition(&mut session, next);
            }
            self.state
                .emit(ClientEvent::Reconnecting { attempt, delay_ms });

            if !self.interruptible_sleep(Duration::from_millis(delay_ms)).await {
                return;
            }

            {
                let mut session = self.state.session.lock().await;
                // The caller may have disconnected while we slept
                if !matches!(session.state, ConnectionState::Reconnecting { .. }) {
                    debug!(state = %session.state, "Reconnection cancelled");
                    return;
                }
                let next = HealthMonitor::determine_next_state(
                    &session.state,
                    ConnectionEvent::ConnectRequested,
                );
                self.state.transition(&mut session, next);
            }

            match self.reconnect_once().await {
                Ok(()) => {
                    info!(attempt = attempt, "Reconnection issued, awaiting acknowledgment");
                    return;
                }
                Err(TransportError::Refused(code)) => {
                    let mut session = self.state.session.lock().await;
                    let next = HealthMonitor::determine_next_state(
                        &session.state,
                        ConnectionEvent::ConnAckReceived(code),
                    );
                    self.state.transition(&mut session, next);
                    drop(session);
                    self.state.emit(ClientEvent::ConnectionRefused(code));
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Reconnection attempt failed");
                    last_reason = DisconnectReason::ConnectionLost(e.to_string());
                }
            }
        }
    }

    async fn reconnect_once(&self) -> Result<(), TransportError> {
        self.transport.loop_stop().await;
        self.transport
            .connect(
                &self.config.broker_host,
                self.config.broker_port,
                self.config.keepalive(),
            )
            .await?;
        self.transport.loop_start(self.event_tx.clone()).await
    }

    async fn abandon_reconnection(&self, attempts: u32, reason: DisconnectReason) {
        let mut session = self.state.session.lock().await;
        if Self::client_disconnected(&session) {
            return;
        }
        session.reconnect_attempts = 0;
        let next =
            HealthMonitor::determine_next_state(&session.state, ConnectionEvent::Disconnected(reason));
        self.state.transition(&mut session, next);
        drop(session);

        error!(attempts = attempts, "Giving up on reconnection");
        self.state.emit(ClientEvent::ReconnectAbandoned { attempts });
    }

    fn client_disconnected(session: &Session) -> bool {
        matches!(
            session.state,
            ConnectionState::Disconnected(DisconnectReason::ClientInitiated)
        )
    }

    /// Sleep that can be interrupted by shutdown; false when interrupted
    async fn interruptible_sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown_rx.changed() => {
                debug!("Reconnection delay interrupted by shutdown");
                false
            }
        }
    }

    async fn on_message(&self, topic: &str, payload: &Bytes) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping message with non-UTF-8 payload");
                return;
            }
        };

        match self.state.handler().await {
            Some(handler) => handler(topic, text),
            None => debug!(topic = %topic, "No message handler registered, dropping message"),
        }
    }

    fn on_sub_ack(&self, packet_id: u16, granted: Vec<Option<QoS>>) {
        match MessageHandler::validate_subscription_success(&granted) {
            Ok(()) => debug!(packet_id = packet_id, "Subscription acknowledged"),
            Err(e) => warn!(packet_id = packet_id, "Subscription partially rejected: {}", e),
        }
        self.state
            .emit(ClientEvent::SubscriptionAcknowledged { packet_id, granted });
    }
}
