//! Managed client over the rumqttc transport against a loopback broker
//!
//! These tests go through real sockets: CONNACK handling, lost links and
//! reconnect/replay as the network loop sees them.

use naila_mqtt::client::ConnectionState;
use naila_mqtt::config::MqttConfig;
use naila_mqtt::testing::{wait_until, FakeBroker};
use naila_mqtt::{ClientEvent, ConnectCode, DisconnectReason, ManagedClient};
use rumqttc::QoS;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config_for(broker: &FakeBroker) -> MqttConfig {
    let mut config = MqttConfig::new("127.0.0.1", broker.port());
    config.client_id = "naila-lifecycle".to_string();
    config.keepalive_secs = 30;
    config
}

#[tokio::test]
async fn test_connect_subscribe_and_publish() {
    let broker = FakeBroker::start().await.unwrap();
    let client = ManagedClient::new(config_for(&broker)).unwrap();
    let mut events = client.events();

    client.subscribe("naila/#", QoS::AtLeastOnce).await.unwrap();
    client.connect().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();

    assert!(wait_until(WAIT, || broker.subscriptions_on(1) == vec!["naila/#".to_string()]).await);

    client
        .publish("naila/status", "online", QoS::AtLeastOnce)
        .await
        .unwrap();

    let acknowledged = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::PublishAcknowledged { .. }) => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await;
    assert!(acknowledged.is_ok());
    assert_eq!(
        broker.published(),
        vec![("naila/status".to_string(), b"online".to_vec())]
    );

    client.shutdown().await.unwrap();
    assert!(wait_until(WAIT, || broker.disconnects() == 1).await);
}

#[tokio::test]
async fn test_reconnect_after_lost_link_replays_subscriptions() {
    let broker = FakeBroker::start().await.unwrap();
    let client = ManagedClient::new(config_for(&broker)).unwrap();

    client.subscribe("naila/sensors/#", QoS::AtLeastOnce).await.unwrap();
    client.subscribe("naila/commands", QoS::AtMostOnce).await.unwrap();
    client.connect().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();
    assert!(wait_until(WAIT, || broker.subscriptions_on(1).len() == 2).await);

    broker.drop_connections();
    assert!(
        wait_until(WAIT, || matches!(
            client.connection_state(),
            ConnectionState::Disconnected(DisconnectReason::ConnectionLost(_))
        ))
        .await
    );

    // Reconnection is off by default; the caller reconnects
    client.connect().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();

    assert!(
        wait_until(WAIT, || broker.subscriptions_on(2)
            == vec!["naila/sensors/#".to_string(), "naila/commands".to_string()])
        .await
    );
    assert_eq!(broker.connections(), 2);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_connect_leaves_client_disconnected() {
    let broker = FakeBroker::start().await.unwrap();
    broker.push_connect_code(4);
    let client = ManagedClient::new(config_for(&broker)).unwrap();

    let result = client.connect().await;

    assert!(matches!(
        result,
        Err(naila_mqtt::ClientError::Connect(
            naila_mqtt::ConnectError::Rejected(ConnectCode::BadCredentials)
        ))
    ));
    assert_eq!(
        client.connection_state(),
        ConnectionState::Disconnected(DisconnectReason::Refused(ConnectCode::BadCredentials))
    );

    // A later connect is answered normally
    client.connect().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();
    client.shutdown().await.unwrap();
}
