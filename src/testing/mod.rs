//! Testing utilities and mock implementations
//!
//! Lets the managed client be exercised without a running MQTT broker:
//! [`MockBroker`] scripts the transport directly, [`FakeBroker`] answers the
//! real rumqttc transport over loopback TCP.

pub mod fake_broker;
pub mod mocks;

pub use fake_broker::{FakeBroker, ReceivedSubscription};
pub use mocks::*;

use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses; returns the final result
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
