//! Connection configuration for the managed MQTT client
//!
//! A [`MqttConfig`] describes the broker endpoint, client identity, credentials
//! and session policy. It can be built from environment variables, loaded from a
//! TOML file, or constructed directly. Every loader validates and fills in
//! defaults before handing the value out, so a client never sees a half-built
//! configuration.
//!
//! ## Environment Variables
//!
//! - `MQTT_BROKER_HOST`: Broker hostname - defaults to `localhost`
//! - `MQTT_BROKER_PORT`: Broker port - defaults to `1883`
//! - `MQTT_CLIENT_ID`: Client identity - generated when unset or empty
//! - `MQTT_USERNAME` / `MQTT_PASSWORD`: Credentials, only used when both are set
//! - `MQTT_KEEPALIVE`: Keepalive interval in seconds - defaults to `60`
//! - `MQTT_QOS`: Default QoS level (0, 1 or 2) - defaults to `1`
//! - `MQTT_CLEAN_SESSION`: `true`/`false`, case-insensitive - defaults to `true`
//! - `MQTT_MAX_RECONNECT_ATTEMPTS`: Automatic reconnection attempts, `0` disables - defaults to `0`
//! - `MQTT_RECONNECT_INITIAL_DELAY_MS`: First reconnection delay - defaults to `500`
//! - `MQTT_RECONNECT_MAX_DELAY_MS`: Reconnection delay cap - defaults to `30000`

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::num::ParseIntError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const ENV_BROKER_HOST: &str = "MQTT_BROKER_HOST";
pub const ENV_BROKER_PORT: &str = "MQTT_BROKER_PORT";
pub const ENV_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";
pub const ENV_KEEPALIVE: &str = "MQTT_KEEPALIVE";
pub const ENV_QOS: &str = "MQTT_QOS";
pub const ENV_CLEAN_SESSION: &str = "MQTT_CLEAN_SESSION";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "MQTT_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_INITIAL_DELAY_MS: &str = "MQTT_RECONNECT_INITIAL_DELAY_MS";
pub const ENV_RECONNECT_MAX_DELAY_MS: &str = "MQTT_RECONNECT_MAX_DELAY_MS";

/// Prefix used for generated client identities
pub const CLIENT_ID_PREFIX: &str = "naila";

/// Broker connection settings for a single client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    /// Broker hostname or IP address
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    /// Broker TCP port
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Client identity, unique per active connection to the broker
    #[serde(default = "generate_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Upper bound on link silence before the transport declares it dead
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Default QoS for subscriptions issued without an explicit level
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Ask the broker to discard prior session state on connect
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_clean_session() -> bool {
    true
}

/// Generate a client identity of the form `naila-<16 hex chars>`.
///
/// The result stays within the 23 characters every MQTT 3.1.1 broker must accept.
pub fn generate_client_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}-{}", &uuid[..16])
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: generate_client_id(),
            username: None,
            password: None,
            keepalive_secs: default_keepalive(),
            qos: default_qos(),
            clean_session: default_clean_session(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Automatic reconnection policy.
///
/// Disabled unless `max_attempts` is non-zero. Delays grow exponentially from
/// `initial_delay_ms` and are capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before the given attempt (1-based): `initial * 2^(attempt-1)`, capped
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Sum of every delay the policy can schedule before giving up
    pub fn max_total_delay_ms(&self) -> u64 {
        (1..=self.max_attempts)
            .map(|attempt| self.backoff_delay_ms(attempt))
            .fold(0u64, u64::saturating_add)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable {var} has non-numeric value '{value}'")]
    InvalidNumber {
        var: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MqttConfig {
    /// Create a configuration for the given broker with every other field defaulted
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            ..Self::default()
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_source(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` delegates here; tests pass a map so they never touch the
    /// process environment.
    pub fn from_env_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let config = Self {
            broker_host: lookup(ENV_BROKER_HOST).unwrap_or_else(default_broker_host),
            broker_port: parse_number(&lookup, ENV_BROKER_PORT, default_broker_port())?,
            client_id: non_empty(ENV_CLIENT_ID).unwrap_or_else(generate_client_id),
            username: non_empty(ENV_USERNAME),
            password: non_empty(ENV_PASSWORD),
            keepalive_secs: parse_number(&lookup, ENV_KEEPALIVE, default_keepalive())?,
            qos: parse_number(&lookup, ENV_QOS, default_qos())?,
            clean_session: lookup(ENV_CLEAN_SESSION)
                .map(|value| value.to_lowercase() == "true")
                .unwrap_or_else(default_clean_session),
            reconnect: ReconnectPolicy {
                max_attempts: parse_number(&lookup, ENV_MAX_RECONNECT_ATTEMPTS, 0)?,
                initial_delay_ms: parse_number(
                    &lookup,
                    ENV_RECONNECT_INITIAL_DELAY_MS,
                    default_initial_delay_ms(),
                )?,
                max_delay_ms: parse_number(
                    &lookup,
                    ENV_RECONNECT_MAX_DELAY_MS,
                    default_max_delay_ms(),
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file; missing fields take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MqttConfig = toml::from_str(&content)?;

        if config.client_id.is_empty() {
            config.client_id = generate_client_id();
        }

        config.validate()?;
        Ok(config)
    }

    /// Override host and port from a `mqtt://host[:port]` or `tcp://host[:port]` URL
    pub fn apply_broker_url(&mut self, broker_url: &str) -> Result<(), ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{broker_url} (unsupported scheme '{}')",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        self.broker_host = host.to_string();
        self.broker_port = url.port().unwrap_or(default_broker_port());
        Ok(())
    }

    /// Check field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker host must not be empty".to_string(),
            ));
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client id must not be empty".to_string(),
            ));
        }

        // CONNECT carries keepalive as a 16-bit field
        if self.keepalive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "keepalive must be at most {} seconds, got {}",
                u16::MAX,
                self.keepalive_secs
            )));
        }

        if self.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "QoS must be 0, 1 or 2, got {}",
                self.qos
            )));
        }

        if self.reconnect.is_enabled() {
            if self.reconnect.initial_delay_ms == 0 {
                return Err(ConfigError::InvalidConfig(
                    "reconnect initial delay must be greater than 0".to_string(),
                ));
            }
            if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
                return Err(ConfigError::InvalidConfig(
                    "reconnect max delay must not be below the initial delay".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Credentials, only when both username and password are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.as_str(), password.as_str())),
            _ => None,
        }
    }

    /// True when exactly one of username/password is set
    pub fn has_partial_credentials(&self) -> bool {
        self.username.is_some() != self.password.is_some()
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Default QoS as a transport level
    pub fn default_qos(&self) -> QoS {
        qos_from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }
}

fn parse_number<F, N>(lookup: &F, var: &str, default: N) -> Result<N, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    N: FromStr<Err = ParseIntError>,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<N>()
            .map_err(|source| ConfigError::InvalidNumber {
                var: var.to_string(),
                value,
                source,
            }),
        None => Ok(default),
    }
}

/// Convert an integer QoS level into the transport's QoS type
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let config = MqttConfig::from_env_source(lookup_from(&[])).unwrap();

        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.keepalive_secs, 60);
        assert_eq!(config.qos, 1);
        assert!(config.clean_session);
        assert!(config.username.is_none());
        assert!(config.password.is_none());
        assert!(!config.reconnect.is_enabled());
        assert!(config.client_id.starts_with("naila-"));
    }

    #[test]
    fn test_env_overrides() {
        let config = MqttConfig::from_env_source(lookup_from(&[
            (ENV_BROKER_HOST, "broker.local"),
            (ENV_BROKER_PORT, "8883"),
            (ENV_CLIENT_ID, "sensor-hub"),
            (ENV_USERNAME, "user"),
            (ENV_PASSWORD, "secret"),
            (ENV_KEEPALIVE, "30"),
            (ENV_QOS, "2"),
            (ENV_CLEAN_SESSION, "FALSE"),
            (ENV_MAX_RECONNECT_ATTEMPTS, "5"),
        ]))
        .unwrap();

        assert_eq!(config.broker_host, "broker.local");
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.client_id, "sensor-hub");
        assert_eq!(config.credentials(), Some(("user", "secret")));
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert_eq!(config.default_qos(), QoS::ExactlyOnce);
        assert!(!config.clean_session);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_clean_session_parsing_is_case_insensitive() {
        let cases = vec![
            ("true", true),
            ("TRUE", true),
            ("True", true),
            ("false", false),
            ("yes", false),
            ("1", false),
            ("", false),
        ];

        for (input, expected) in cases {
            let config =
                MqttConfig::from_env_source(lookup_from(&[(ENV_CLEAN_SESSION, input)])).unwrap();
            assert_eq!(config.clean_session, expected, "Failed for input: '{input}'");
        }
    }

    #[test]
    fn test_unparseable_numbers_fail() {
        for var in [ENV_BROKER_PORT, ENV_KEEPALIVE, ENV_QOS] {
            let result = MqttConfig::from_env_source(lookup_from(&[(var, "abc")]));
            match result {
                Err(ConfigError::InvalidNumber { var: failed, value, .. }) => {
                    assert_eq!(failed, var);
                    assert_eq!(value, "abc");
                }
                other => panic!("Expected InvalidNumber for {var}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_port_out_of_range_fails() {
        let result = MqttConfig::from_env_source(lookup_from(&[(ENV_BROKER_PORT, "70000")]));
        assert!(matches!(result, Err(ConfigError::InvalidNumber { .. })));
    }

    #[test]
    fn test_qos_out_of_range_fails_validation() {
        let result = MqttConfig::from_env_source(lookup_from(&[(ENV_QOS, "3")]));
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_keepalive_must_fit_sixteen_bits() {
        let result = MqttConfig::from_env_source(lookup_from(&[(ENV_KEEPALIVE, "65536")]));
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let config = MqttConfig::from_env_source(lookup_from(&[(ENV_KEEPALIVE, "65535")])).unwrap();
        assert_eq!(config.keepalive_secs, 65535);
    }

    #[test]
    fn test_empty_client_id_is_generated() {
        let config = MqttConfig::from_env_source(lookup_from(&[(ENV_CLIENT_ID, "")])).unwrap();
        assert!(config.client_id.starts_with("naila-"));
    }

    #[test]
    fn test_generated_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(id.len(), "naila-".len() + 16);
        assert!(id.len() <= 23);
        assert!(id["naila-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_partial_credentials_are_ignored() {
        let config = MqttConfig::from_env_source(lookup_from(&[(ENV_USERNAME, "user")])).unwrap();
        assert_eq!(config.credentials(), None);
        assert!(config.has_partial_credentials());
    }

    #[test]
    fn test_apply_broker_url() {
        let mut config = MqttConfig::default();
        config.apply_broker_url("mqtt://broker.example.com:1884").unwrap();
        assert_eq!(config.broker_host, "broker.example.com");
        assert_eq!(config.broker_port, 1884);

        config.apply_broker_url("tcp://10.0.0.5").unwrap();
        assert_eq!(config.broker_host, "10.0.0.5");
        assert_eq!(config.broker_port, 1883);

        assert!(matches!(
            config.apply_broker_url("invalid-url"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            config.apply_broker_url("http://broker.example.com"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let config = MqttConfig::new("  ", 1883);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_reconnect_delays() {
        let mut config = MqttConfig::default();
        config.reconnect = ReconnectPolicy {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 100,
        };
        assert!(config.validate().is_err());

        // Disabled policies are not checked
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay_is_exponential_and_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
        };

        assert_eq!(policy.backoff_delay_ms(1), 100);
        assert_eq!(policy.backoff_delay_ms(2), 200);
        assert_eq!(policy.backoff_delay_ms(3), 400);
        assert_eq!(policy.backoff_delay_ms(4), 800);
        assert_eq!(policy.backoff_delay_ms(5), 1000);
        assert_eq!(policy.backoff_delay_ms(60), 1000);
    }

    #[test]
    fn test_max_total_delay() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.max_total_delay_ms(), 100 + 200 + 400);
        assert_eq!(ReconnectPolicy::default().max_total_delay_ms(), 0);
    }

    #[test]
    fn test_qos_conversions() {
        assert_eq!(qos_from_level(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_level(3), None);

        for level in 0..=2 {
            assert_eq!(qos_level(qos_from_level(level).unwrap()), level);
        }
    }

    #[test]
    fn test_toml_config_with_defaults() {
        let toml_content = r#"
broker_host = "broker.internal"
username = "svc"
password = "pw"

[reconnect]
max_attempts = 4
"#;

        let config: MqttConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker_host, "broker.internal");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.credentials(), Some(("svc", "pw")));
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert!(config.client_id.starts_with("naila-"));
    }
}
