//! Shared payloads, options and wait helpers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use unibus::{BrokerOptions, DriverType, MqttOptions, SubscribeOptions};

pub const ALL_DRIVERS: [DriverType; 4] = [
    DriverType::Memory,
    DriverType::Log,
    DriverType::Queue,
    DriverType::Mqtt,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
}

pub fn reading() -> SensorReading {
    SensorReading {
        temperature: 23.5,
        humidity: 41.0,
    }
}

/// Broker options with a fast session retry.
pub fn fast_options() -> BrokerOptions {
    BrokerOptions::builder()
        .mqtt(MqttOptions {
            reconnect_interval: Duration::from_millis(10),
            ..MqttOptions::default()
        })
        .build()
        .expect("valid options")
}

/// Grouped subscription with a short fetch wait, usable on every adapter.
pub fn group(name: &str, auto_ack: bool) -> SubscribeOptions {
    SubscribeOptions::builder()
        .queue_name(name)
        .auto_ack(auto_ack)
        .max_wait(Duration::from_millis(50))
        .build()
        .expect("valid subscribe options")
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

/// Nothing arrives within `window`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) {
    if let Ok(Some(unexpected)) = timeout(window, rx.recv()).await {
        panic!("unexpected delivery: {unexpected:?}");
    }
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
