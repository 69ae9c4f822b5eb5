//! Observability for the managed client
//!
//! Structured logging through `tracing`, plus the [`ClientEvent`] stream every
//! client publishes for lifecycle changes.

pub mod events;
pub mod logging;

pub use events::{ClientEvent, EventBus, EVENT_CHANNEL_CAPACITY};
pub use logging::{init_logging, LogFormat, LoggingConfig};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
