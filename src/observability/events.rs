//! Lifecycle events published by the managed client
//!
//! Every reaction to a transport event ends in a [`ClientEvent`] on a
//! `tokio::sync::broadcast` channel. Receivers that fall behind lose the oldest
//! events; nothing in the client depends on anyone listening.

use crate::transport::{ConnectCode, DisconnectReason};
use rumqttc::QoS;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per receiver before the oldest are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Broker accepted the connection and desired subscriptions were replayed
    Connected {
        session_present: bool,
        replayed: usize,
    },
    /// Broker answered the connect request with a refusal code
    ConnectionRefused(ConnectCode),
    Disconnected(DisconnectReason),
    /// `granted` holds `None` for every filter the broker rejected
    SubscriptionAcknowledged {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    PublishAcknowledged {
        packet_id: u16,
    },
    /// Automatic reconnection scheduled after `delay_ms`
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    /// Automatic reconnection gave up
    ReconnectAbandoned {
        attempts: u32,
    },
}

/// Fan-out sender for [`ClientEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event; having no receivers is not an error
    pub fn emit(&self, event: ClientEvent) {
        if self.sender.send(event).is_err() {
            trace!("No client event receivers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_receivers() {
        let bus = EventBus::new();
        bus.emit(ClientEvent::PublishAcknowledged { packet_id: 1 });
    }

    #[tokio::test]
    async fn test_receivers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ClientEvent::Reconnecting {
            attempt: 1,
            delay_ms: 500,
        });
        bus.emit(ClientEvent::ReconnectAbandoned { attempts: 1 });

        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::Reconnecting {
                attempt: 1,
                delay_ms: 500
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::ReconnectAbandoned { attempts: 1 }
        );
    }
}
