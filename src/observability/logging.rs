//! Structured logging system using tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO naila-mqtt subscribe
//!
//! # Development with colors
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG naila-mqtt publish --topic test_topic
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are too chatty below WARN
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string; anything unknown falls back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Settings for [`init_logging`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Full filter override, `RUST_LOG` syntax
    pub filter_override: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            filter_override: None,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_env_source(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_env_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("LOG_LEVEL")
            .map(|value| parse_level(&value))
            .unwrap_or(Level::INFO);

        let format = lookup("LOG_FORMAT")
            .map(|value| LogFormat::parse(&value))
            .unwrap_or(LogFormat::Json);

        let include_spans = lookup("LOG_SPANS")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            level,
            format,
            include_spans,
            filter_override: lookup("RUST_LOG").filter(|value| !value.is_empty()),
        }
    }

    /// The `EnvFilter` directive string this configuration resolves to
    pub fn filter_directives(&self) -> String {
        match &self.filter_override {
            Some(filter) => filter.clone(),
            None => std::iter::once(self.level.to_string().to_lowercase())
                .chain(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Unknown levels fall back to INFO
pub fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::new(config.filter_directives());
    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(config.span_events()))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(config.span_events()),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(config.span_events()),
            )
            .try_init(),
    }
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

// Re-export macros for convenience
pub use {lifecycle_span, mqtt_span};
