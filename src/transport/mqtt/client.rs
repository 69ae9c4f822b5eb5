//! Impure I/O operations for the rumqttc transport
//!
//! [`RumqttTransport`] owns the `AsyncClient`/`EventLoop` pair for one client
//! identity. `connect` performs the first poll so socket failures and broker
//! refusals surface synchronously; `loop_start` hands the event loop to a
//! background task that forwards routed events to the managed client.

use super::connection::{
    configure_mqtt_options, transport_error_from, Credentials, DISCONNECT_FLUSH_TIMEOUT,
    LOOP_STOP_TIMEOUT, REQUEST_CHANNEL_CAPACITY,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{
    DisconnectReason, EventSender, Transport, TransportError, TransportEvent, TransportOptions,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Background loop task; hands the event loop back when stopped
struct LoopTask {
    handle: JoinHandle<Option<EventLoop>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Production transport backed by rumqttc
pub struct RumqttTransport {
    options: TransportOptions,
    credentials: Option<Credentials>,
    client: Mutex<Option<AsyncClient>>,
    event_loop: Mutex<Option<EventLoop>>,
    /// First event polled by `connect`, replayed when the loop starts
    pending_event: Mutex<Option<Event>>,
    loop_task: Mutex<Option<LoopTask>>,
}

impl RumqttTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            credentials: None,
            client: Mutex::new(None),
            event_loop: Mutex::new(None),
            pending_event: Mutex::new(None),
            loop_task: Mutex::new(None),
        }
    }

    /// Factory matching `ManagedClient::with_transport`
    pub fn create(options: &TransportOptions) -> Result<Self, TransportError> {
        Ok(Self::new(options.clone()))
    }

    async fn current_client(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::NotStarted("connect() has not been called".to_string()))
    }

    /// Forward one rumqttc event; returns false when the receiver is gone
    fn forward_event(event: &Event, events: &EventSender) -> bool {
        match MessageHandler::route_mqtt_event(event) {
            EventRoute::Forward(transport_event) => events.send(transport_event).is_ok(),
            other => {
                MessageHandler::log_unforwarded(&other);
                true
            }
        }
    }

    /// Poll until shutdown or a connection error, forwarding every event
    async fn run_event_loop(
        mut event_loop: EventLoop,
        events: EventSender,
        mut shutdown_rx: watch::Receiver<bool>,
        client_id: String,
    ) -> Option<EventLoop> {
        info!(client_id = %client_id, "MQTT network loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(client_id = %client_id, "MQTT network loop stop requested");
                        return Some(event_loop);
                    }
                }

                result = event_loop.poll() => {
                    match result {
                        Ok(event) => {
                            if !Self::forward_event(&event, &events) {
                                warn!(client_id = %client_id, "Event receiver dropped, stopping network loop");
                                return Some(event_loop);
                            }
                        }
                        Err(e) => {
                            error!(client_id = %client_id, error = %e, "MQTT network loop error");
                            let _ = events.send(TransportEvent::Disconnected {
                                reason: DisconnectReason::ConnectionLost(e.to_string()),
                            });
                            return None;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), TransportError> {
        let mqtt_options = configure_mqtt_options(
            &self.options,
            self.credentials.as_ref(),
            host,
            port,
            keepalive,
        );

        // A fresh client/event loop per connection attempt
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        debug!(
            client_id = %self.options.client_id,
            host = %host,
            port = port,
            "Opening MQTT connection"
        );

        // The first poll performs the TCP connect and the CONNECT/CONNACK exchange
        let first_event = event_loop.poll().await.map_err(transport_error_from)?;

        *self.client.lock().await = Some(client);
        *self.event_loop.lock().await = Some(event_loop);
        *self.pending_event.lock().await = Some(first_event);
        Ok(())
    }

    async fn loop_start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut loop_task = self.loop_task.lock().await;
        if let Some(task) = loop_task.take() {
            let fresh_connection = self.event_loop.lock().await.is_some();
            if !task.handle.is_finished() && !fresh_connection {
                debug!("MQTT network loop already running");
                *loop_task = Some(task);
                return Ok(());
            }

            // Ended with the previous link, or superseded by a newer connect
            debug!(
                finished = task.handle.is_finished(),
                "Replacing previous MQTT network loop"
            );
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }

        let event_loop = self.event_loop.lock().await.take().ok_or_else(|| {
            TransportError::NotStarted("no event loop; connect() first".to_string())
        })?;

        if let Some(first_event) = self.pending_event.lock().await.take() {
            Self::forward_event(&first_event, &events);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            events,
            shutdown_rx,
            self.options.client_id.clone(),
        ));

        *loop_task = Some(LoopTask {
            handle,
            shutdown_tx,
        });
        Ok(())
    }

    async fn loop_stop(&self) {
        let Some(task) = self.loop_task.lock().await.take() else {
            return;
        };

        let _ = task.shutdown_tx.send(true);

        match tokio::time::timeout(LOOP_STOP_TIMEOUT, task.handle).await {
            Ok(Ok(Some(event_loop))) => {
                *self.event_loop.lock().await = Some(event_loop);
                debug!("MQTT network loop stopped gracefully");
            }
            Ok(Ok(None)) => debug!("MQTT network loop had already ended"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT network loop ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => warn!("MQTT network loop didn't stop in time, abandoning it"),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(client) = self.client.lock().await.take() else {
            return Ok(());
        };

        client
            .disconnect()
            .await
            .map_err(TransportError::request)?;

        // With the loop stopped nobody polls; drive the event loop until DISCONNECT is written
        if let Some(mut event_loop) = self.event_loop.lock().await.take() {
            let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Event loop closed while flushing DISCONNECT: {}", e);
                            return false;
                        }
                    }
                }
            })
            .await;

            if !matches!(flushed, Ok(true)) {
                warn!("DISCONNECT packet may not have reached the broker");
            }
        }

        self.pending_event.lock().await.take();
        info!(client_id = %self.options.client_id, "MQTT transport disconnected");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.current_client().await?;
        client
            .subscribe(topic, qos)
            .await
            .map_err(TransportError::request)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let client = self.current_client().await?;
        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(TransportError::request)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        // Can't await in Drop; abort the loop task if it's still running
        if let Some(task) = self.loop_task.get_mut().take() {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}
