//! rumqttc-backed implementation of [`crate::transport::Transport`]
//!
//! Pure functions are kept apart from I/O so the interesting decisions can be
//! tested without a broker:
//!
//! - [`connection`] - `MqttOptions` construction and error mapping
//! - [`message_handler`] - routing of raw rumqttc events into transport events
//! - [`client`] - the impure `AsyncClient`/`EventLoop` driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use naila_mqtt::{ManagedClient, MqttConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttConfig::new("localhost", 1883);
//! let client = ManagedClient::new(config)?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttTransport;
pub use connection::{configure_mqtt_options, connect_code_from, transport_error_from, Credentials};
pub use message_handler::{EventRoute, MessageHandler};
