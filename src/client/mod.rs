//! Managed MQTT client
//!
//! [`ManagedClient`] keeps a persistent broker connection on top of a
//! [`Transport`]. It records subscription intent independently of the
//! connection, replays that intent in order on every accepted connect, and
//! hands inbound messages to a single registered callback.
//!
//! Caller operations run on whatever task calls them. Transport events are
//! handled by a dedicated reaction task spawned by [`ManagedClient::setup`];
//! both sides share one session lock, and the connection state is mirrored on
//! a watch channel for lock-free reads.
//!
//! ```rust,no_run
//! use naila_mqtt::{ManagedClient, MqttConfig};
//! use rumqttc::QoS;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ManagedClient::new(MqttConfig::from_env()?)?;
//! client
//!     .set_message_handler(|topic, payload| println!("{topic}: {payload}"))
//!     .await;
//! client.subscribe("naila/sensors/#", QoS::AtLeastOnce).await?;
//! client.connect().await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

mod health_monitor;
mod reactions;
mod state;

pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use state::{ConnectionState, MessageCallback, SubscribeOutcome, Subscription};

use crate::config::{qos_level, MqttConfig};
use crate::error::{ClientError, ClientResult, ConnectError};
use crate::observability::ClientEvent;
use crate::transport::mqtt::RumqttTransport;
use crate::transport::{
    DisconnectReason, EventSender, Transport, TransportError, TransportOptions,
};
use reactions::EventReactions;
use rumqttc::QoS;
use state::ClientState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound on how long `shutdown` waits for the reaction task
const REACTIONS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type TransportFactory<T> =
    Box<dyn Fn(&TransportOptions) -> Result<T, TransportError> + Send + Sync>;

/// Everything created by `setup`
struct Runtime<T: Transport> {
    transport: Arc<T>,
    event_tx: EventSender,
    reactions: Option<JoinHandle<()>>,
}

pub struct ManagedClient<T: Transport = RumqttTransport> {
    config: Arc<MqttConfig>,
    state: Arc<ClientState>,
    factory: TransportFactory<T>,
    runtime: Mutex<Option<Runtime<T>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ManagedClient<RumqttTransport> {
    /// Create a client backed by the rumqttc transport
    pub fn new(config: MqttConfig) -> ClientResult<Self> {
        Self::with_transport(config, RumqttTransport::create)
    }
}

impl<T: Transport> ManagedClient<T> {
    /// Create a client that builds its transport through `factory`.
    ///
    /// The factory runs once, on the first `setup` (or `connect`).
    pub fn with_transport<F>(config: MqttConfig, factory: F) -> ClientResult<Self>
    where
        F: Fn(&TransportOptions) -> Result<T, TransportError> + Send + Sync + 'static,
    {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(ClientState::new()),
            factory: Box::new(factory),
            runtime: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Create the transport handle and start the event reaction task. Idempotent.
    pub async fn setup(&self) -> ClientResult<()> {
        {
            let mut runtime = self.runtime.lock().await;
            if runtime.is_some() {
                debug!("Client already set up");
                return Ok(());
            }

            let options = TransportOptions {
                client_id: self.config.client_id.clone(),
                clean_session: self.config.clean_session,
            };
            let mut transport = (self.factory)(&options)?;

            match self.config.credentials() {
                Some((username, password)) => transport.set_credentials(username, password),
                None if self.config.has_partial_credentials() => {
                    warn!("Only one of username/password configured, connecting without credentials")
                }
                None => {}
            }

            let transport = Arc::new(transport);
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let reactions = EventReactions::new(
                self.state.clone(),
                transport.clone(),
                self.config.clone(),
                event_tx.clone(),
                self.shutdown_rx.clone(),
            );
            let handle = tokio::spawn(reactions.run(event_rx));

            *runtime = Some(Runtime {
                transport,
                event_tx,
                reactions: Some(handle),
            });
        }

        let mut session = self.state.session.lock().await;
        let next =
            HealthMonitor::determine_next_state(&session.state, ConnectionEvent::SetupCompleted);
        self.state.transition(&mut session, next);

        info!(client_id = %self.config.client_id, "MQTT client set up");
        Ok(())
    }

    /// Open the connection and start the transport loop.
    ///
    /// Returns once the connect request is on its way; the broker's answer
    /// arrives asynchronously. Use [`Self::wait_until_connected`] to await it.
    pub async fn connect(&self) -> ClientResult<()> {
        let span = crate::mqtt_span!(
            operation = "connect",
            client_id = %self.config.client_id,
            broker = %format!("{}:{}", self.config.broker_host, self.config.broker_port)
        );

        self.connect_inner().instrument(span).await
    }

    /// Wait until the broker accepts the pending connect
    pub async fn wait_until_connected(&self, timeout: Duration) -> ClientResult<()> {
        let mut state_rx = self.state.watch();

        let wait = async move {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(DisconnectReason::Refused(code)) => {
                        return Err(ConnectError::Rejected(code))
                    }
                    ConnectionState::Disconnected(reason) => {
                        return Err(ConnectError::Aborted(reason))
                    }
                    _ => {}
                }

                if state_rx.changed().await.is_err() {
                    return Err(ConnectError::Aborted(DisconnectReason::ConnectionLost(
                        "client dropped".to_string(),
                    )));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ConnectError::Timeout(timeout).into()),
        }
    }

    /// Close the connection.
    ///
    /// Acts while connected, while a connect awaits its acknowledgment (which
    /// it abandons), or while waiting for an automatic reconnection attempt
    /// (which it cancels). Otherwise a no-op.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let Some(transport) = self.current_transport().await else {
            debug!("Disconnect requested before setup, nothing to do");
            return Ok(());
        };

        let mut session = self.state.session.lock().await;
        let link_open = match &session.state {
            ConnectionState::Connected | ConnectionState::Connecting => true,
            ConnectionState::Reconnecting { .. } => false,
            other => {
                debug!(state = %other, "Disconnect requested while not connected, nothing to do");
                return Ok(());
            }
        };

        self.state.transition(
            &mut session,
            ConnectionState::Disconnected(DisconnectReason::ClientInitiated),
        );
        drop(session);

        let result = if link_open {
            transport.loop_stop().await;
            transport.disconnect().await
        } else {
            info!("Pending reconnection cancelled");
            Ok(())
        };

        self.state
            .emit(ClientEvent::Disconnected(DisconnectReason::ClientInitiated));

        result?;
        info!(client_id = %self.config.client_id, "Disconnected from MQTT broker");
        Ok(())
    }

    /// Record a subscription and, when connected, send it to the broker now.
    ///
    /// The subscription is replayed on every later accepted connect, whatever
    /// this call returns.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> ClientResult<SubscribeOutcome> {
        if topic.is_empty() {
            return Err(ClientError::invalid_topic("topic filter must not be empty"));
        }
        if !rumqttc::valid_filter(topic) {
            return Err(ClientError::invalid_topic(format!(
                "'{topic}' is not a valid topic filter"
            )));
        }

        let transport = self.current_transport().await;
        let mut session = self.state.session.lock().await;
        session.subscriptions.push(Subscription::new(topic, qos));

        let transport = match transport {
            Some(transport) if HealthMonitor::can_subscribe(&session.state) => transport,
            _ => {
                debug!(topic = %topic, qos = qos_level(qos), "Subscription queued until connected");
                return Ok(SubscribeOutcome::Queued);
            }
        };

        // Still under the session lock so a concurrent replay can't issue it twice
        transport.subscribe(topic, qos).await?;
        drop(session);

        info!(topic = %topic, qos = qos_level(qos), "Subscription requested");
        Ok(SubscribeOutcome::Requested)
    }

    /// Subscribe with the configured default QoS
    pub async fn subscribe_default(&self, topic: &str) -> ClientResult<SubscribeOutcome> {
        self.subscribe(topic, self.config.default_qos()).await
    }

    /// Publish a message. Fails without touching the transport when not connected.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> ClientResult<()> {
        let state = self.state.current();
        if !HealthMonitor::can_publish(&state) {
            warn!(topic = %topic, state = %state, "Cannot publish while not connected");
            return Err(ClientError::not_connected(state));
        }

        if topic.is_empty() {
            return Err(ClientError::invalid_topic("topic must not be empty"));
        }
        if !rumqttc::valid_topic(topic) {
            return Err(ClientError::invalid_topic(format!(
                "'{topic}' is not a valid publish topic"
            )));
        }

        let transport = self
            .current_transport()
            .await
            .ok_or_else(|| ClientError::not_connected(self.state.current()))?;

        transport.publish(topic, payload.into(), qos).await?;
        debug!(topic = %topic, qos = qos_level(qos), "Message published");
        Ok(())
    }

    /// Register the callback for inbound messages, replacing any previous one
    pub async fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.state.set_handler(Some(Arc::new(handler))).await;
    }

    pub async fn clear_message_handler(&self) {
        self.state.set_handler(None).await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state.current().is_connected()
    }

    /// Snapshot of every subscription ever requested, in order
    pub async fn desired_subscriptions(&self) -> Vec<Subscription> {
        self.state.session.lock().await.subscriptions.clone()
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.state.events()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    /// Disconnect, then stop the reaction task
    pub async fn shutdown(&self) -> ClientResult<()> {
        let result = self.disconnect().await;

        let _ = self.shutdown_tx.send(true);
        let handle = self
            .runtime
            .lock()
            .await
            .as_mut()
            .and_then(|runtime| runtime.reactions.take());

        if let Some(handle) = handle {
            match tokio::time::timeout(REACTIONS_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Event reaction task stopped gracefully"),
                Ok(Err(e)) => warn!("Event reaction task ended with error: {}", e),
                Err(_) => warn!("Event reaction task didn't stop in time"),
            }
        }

        result
    }

    async fn connect_inner(&self) -> ClientResult<()> {
        self.setup().await?;
        let (transport, event_tx) = self.runtime_handles().await?;

        {
            let mut session = self.state.session.lock().await;
            if session.state.is_connected() || session.state.is_connecting() {
                return Err(ConnectError::AlreadyConnected.into());
            }
            session.reconnect_attempts = 0;
            let next = HealthMonitor::determine_next_state(
                &session.state,
                ConnectionEvent::ConnectRequested,
            );
            self.state.transition(&mut session, next);
        }

        let host = self.config.broker_host.as_str();
        let port = self.config.broker_port;
        info!(host = %host, port = port, "Connecting to MQTT broker");

        if let Err(e) = transport.connect(host, port, self.config.keepalive()).await {
            let (reason, error) = match e {
                TransportError::Refused(code) => {
                    (DisconnectReason::Refused(code), ConnectError::Rejected(code))
                }
                other => (
                    DisconnectReason::ConnectionLost(other.to_string()),
                    ConnectError::Socket {
                        host: host.to_string(),
                        port,
                        source: other,
                    },
                ),
            };
            error!(error = %error, "MQTT connect failed");
            self.set_disconnected(reason).await;
            return Err(error.into());
        }

        if let Err(e) = transport.loop_start(event_tx).await {
            error!(error = %e, "Failed to start MQTT network loop");
            self.set_disconnected(DisconnectReason::ConnectionLost(e.to_string()))
                .await;
            return Err(ClientError::Transport(e));
        }

        Ok(())
    }

    async fn current_transport(&self) -> Option<Arc<T>> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| runtime.transport.clone())
    }

    async fn runtime_handles(&self) -> Result<(Arc<T>, EventSender), TransportError> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| (runtime.transport.clone(), runtime.event_tx.clone()))
            .ok_or_else(|| TransportError::NotStarted("client not set up".to_string()))
    }

    async fn set_disconnected(&self, reason: DisconnectReason) {
        let mut session = self.state.session.lock().await;
        let next = HealthMonitor::determine_next_state(
            &session.state,
            ConnectionEvent::Disconnected(reason),
        );
        self.state.transition(&mut session, next);
    }
}

impl<T: Transport> Drop for ManagedClient<T> {
    fn drop(&mut self) {
        // Can't await in Drop; signal the reaction task and abort it
        let _ = self.shutdown_tx.send(true);
        if let Some(runtime) = self.runtime.get_mut().as_mut() {
            if let Some(handle) = runtime.reactions.take() {
                handle.abort();
            }
        }
    }
}
