//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use naila_mqtt::config::{ConfigError, MqttConfig, CLIENT_ID_PREFIX};
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
broker_host = "broker.local"
broker_port = 8883
client_id = "naila-kitchen"
username = "naila"
password = "secret"
keepalive_secs = 30
qos = 2
clean_session = false

[reconnect]
max_attempts = 5
initial_delay_ms = 250
max_delay_ms = 4000
"#
    )
    .unwrap();

    let config = MqttConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker_host, "broker.local");
    assert_eq!(config.broker_port, 8883);
    assert_eq!(config.client_id, "naila-kitchen");
    assert_eq!(config.credentials(), Some(("naila", "secret")));
    assert_eq!(config.keepalive_secs, 30);
    assert_eq!(config.qos, 2);
    assert!(!config.clean_session);
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.reconnect.initial_delay_ms, 250);
    assert_eq!(config.reconnect.max_delay_ms, 4000);
}

#[test]
fn test_empty_toml_takes_defaults() {
    let temp_file = NamedTempFile::new().unwrap();

    let config = MqttConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker_host, "localhost");
    assert_eq!(config.broker_port, 1883);
    assert_eq!(config.keepalive_secs, 60);
    assert_eq!(config.qos, 1);
    assert!(config.clean_session);
    assert!(!config.reconnect.is_enabled());
    assert!(config.client_id.starts_with(CLIENT_ID_PREFIX));
    assert_eq!(config.credentials(), None);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = MqttConfig::load_from_file(std::path::Path::new("/nonexistent/naila.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "broker_port = \"not a number\"").unwrap();

    let result = MqttConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_fail_validation() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "qos = 3").unwrap();

    let result = MqttConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_port_defaults_to_1883_when_unset() {
    let config = MqttConfig::from_env_source(env(&[("MQTT_BROKER_HOST", "broker.local")])).unwrap();

    assert_eq!(config.broker_host, "broker.local");
    assert_eq!(config.broker_port, 1883);
}

#[test]
fn test_non_numeric_port_is_reported() {
    let result = MqttConfig::from_env_source(env(&[("MQTT_BROKER_PORT", "eighteen")]));

    match result {
        Err(ConfigError::InvalidNumber { var, value, .. }) => {
            assert_eq!(var, "MQTT_BROKER_PORT");
            assert_eq!(value, "eighteen");
        }
        other => panic!("Expected InvalidNumber, got {other:?}"),
    }
}

#[test]
fn test_broker_url_overrides_host_and_port() {
    let mut config = MqttConfig::from_env_source(env(&[])).unwrap();

    config.apply_broker_url("mqtt://broker.local:1884").unwrap();
    assert_eq!(config.broker_host, "broker.local");
    assert_eq!(config.broker_port, 1884);

    config.apply_broker_url("tcp://10.0.0.5").unwrap();
    assert_eq!(config.broker_host, "10.0.0.5");
    assert_eq!(config.broker_port, 1883);

    assert!(matches!(
        config.apply_broker_url("http://broker.local"),
        Err(ConfigError::InvalidBrokerUrl(_))
    ));
}

#[test]
fn test_generated_client_ids_differ() {
    let first = MqttConfig::from_env_source(env(&[])).unwrap();
    let second = MqttConfig::from_env_source(env(&[])).unwrap();

    assert_ne!(first.client_id, second.client_id);
    assert!(first.client_id.len() <= 23);
}
