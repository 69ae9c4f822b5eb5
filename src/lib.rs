//! naila-mqtt - managed MQTT client
//!
//! A client for an MQTT 3.1.1 broker that keeps a persistent connection,
//! remembers what it should be subscribed to independently of the connection,
//! replays those subscriptions on every successful connect, and dispatches
//! inbound messages to a single registered callback.
//!
//! # Overview
//!
//! - [`config`] - broker endpoint, identity, credentials and session policy
//! - [`client`] - the [`ManagedClient`] and its connection state machine
//! - [`transport`] - the [`Transport`] boundary and its rumqttc implementation
//! - [`observability`] - structured logging and the [`ClientEvent`] stream
//! - [`testing`] - a scripted mock broker
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use naila_mqtt::{ManagedClient, MqttConfig};
//! use rumqttc::QoS;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ManagedClient::new(MqttConfig::new("localhost", 1883))?;
//! client.connect().await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//! client
//!     .publish("test_topic", "MQTT client is working", QoS::AtLeastOnce)
//!     .await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use client::{ConnectionState, ManagedClient, SubscribeOutcome, Subscription};
pub use config::{ConfigError, MqttConfig, ReconnectPolicy};
pub use error::{ClientError, ClientResult, ConnectError};
pub use observability::ClientEvent;
pub use transport::mqtt::RumqttTransport;
pub use transport::{ConnectCode, DisconnectReason, Transport, TransportError, TransportEvent};
