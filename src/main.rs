//! naila-mqtt - command line entry point
//!
//! `publish` sends one message and exits; `subscribe` prints every message on
//! a topic until interrupted.

use clap::{Parser, Subcommand};
use naila_mqtt::client::HealthMonitor;
use naila_mqtt::config::{qos_from_level, MqttConfig};
use naila_mqtt::observability::{init_logging, ClientEvent, LoggingConfig};
use naila_mqtt::{DisconnectReason, ManagedClient};
use rumqttc::QoS;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

const DEFAULT_TOPIC: &str = "test_topic";
const DEFAULT_MESSAGE: &str = "MQTT client is working";

/// How long `publish` waits for the broker to acknowledge a QoS 1/2 message
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Managed MQTT client
#[derive(Parser)]
#[command(name = "naila-mqtt")]
#[command(about = "Publish to or subscribe on an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML); environment variables are used otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL overriding host and port, e.g. mqtt://localhost:1883
    #[arg(long, value_name = "URL", env = "MQTT_BROKER_URL")]
    broker_url: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish one message, disconnect
    Publish {
        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
        #[arg(long, default_value = DEFAULT_MESSAGE)]
        message: String,
        /// QoS level; the configured default when omitted
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
    },
    /// Subscribe and print messages until Ctrl-C
    Subscribe {
        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
    },
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    match cli.verbose {
        0 => {}
        1 => logging.level = Level::DEBUG,
        _ => logging.level = Level::TRACE,
    }
    if let Err(e) = init_logging(&logging) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    info!(
        client_id = %config.client_id,
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        "Starting naila-mqtt v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
        } => run_publish(config, &topic, &message, qos).await,
        Commands::Subscribe { topic, qos } => run_subscribe(config, &topic, qos).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<MqttConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            MqttConfig::load_from_file(path)?
        }
        None => MqttConfig::from_env()?,
    };

    if let Some(url) = &cli.broker_url {
        config.apply_broker_url(url)?;
    }

    Ok(config)
}

fn resolve_qos(config: &MqttConfig, level: Option<u8>) -> QoS {
    level
        .and_then(qos_from_level)
        .unwrap_or_else(|| config.default_qos())
}

async fn connect_and_confirm(client: &ManagedClient) -> Result<(), Box<dyn std::error::Error>> {
    let config = client.config();
    let timeout = HealthMonitor::calculate_connection_timeout(config.keepalive(), &config.reconnect);
    client.connect().await?;
    client.wait_until_connected(timeout).await?;
    Ok(())
}

async fn run_publish(
    config: MqttConfig,
    topic: &str,
    message: &str,
    qos: Option<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = resolve_qos(&config, qos);
    let client = ManagedClient::new(config)?;
    let mut events = client.events();

    connect_and_confirm(&client).await?;
    client.publish(topic, message, qos).await?;

    if qos != QoS::AtMostOnce {
        match tokio::time::timeout(PUBLISH_ACK_TIMEOUT, wait_for_publish_ack(&mut events)).await {
            Ok(true) => info!(topic = %topic, "Publish acknowledged by broker"),
            Ok(false) => warn!("Event stream closed before the publish was acknowledged"),
            Err(_) => warn!("No publish acknowledgment within {:?}", PUBLISH_ACK_TIMEOUT),
        }
    }

    println!("Published to {topic}: {message}");
    client.shutdown().await?;
    Ok(())
}

async fn wait_for_publish_ack(events: &mut broadcast::Receiver<ClientEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(ClientEvent::PublishAcknowledged { .. }) => return true,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

async fn run_subscribe(
    config: MqttConfig,
    topic: &str,
    qos: Option<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = resolve_qos(&config, qos);
    let client = ManagedClient::new(config)?;
    let mut events = client.events();

    client
        .set_message_handler(|topic, payload| println!("{topic}: {payload}"))
        .await;

    // Queued now, issued by the replay on connect
    client.subscribe(topic, qos).await?;
    connect_and_confirm(&client).await?;
    info!(topic = %topic, "Listening for messages, press Ctrl-C to stop");

    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C, shutting down gracefully...");
            Ok(())
        }
        reason = wait_for_connection_loss(&mut events, client.config().reconnect.is_enabled()) => {
            Err(format!("connection lost: {reason}"))
        }
    };

    client.shutdown().await?;
    outcome.map_err(Into::into)
}

/// Resolves when the connection is gone for good
async fn wait_for_connection_loss(
    events: &mut broadcast::Receiver<ClientEvent>,
    reconnect_enabled: bool,
) -> String {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Disconnected(reason))
                if reason.is_unexpected() && !reconnect_enabled =>
            {
                return reason.to_string()
            }
            Ok(ClientEvent::Disconnected(reason @ DisconnectReason::Refused(_))) => {
                return reason.to_string()
            }
            Ok(ClientEvent::ConnectionRefused(code)) => return code.to_string(),
            Ok(ClientEvent::ReconnectAbandoned { attempts }) => {
                return format!("gave up after {attempts} reconnection attempts")
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return "client stopped".to_string(),
        }
    }
}
