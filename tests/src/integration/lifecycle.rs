//! # Lifecycle Scenarios
//!
//! Connection state, driver selection, the server's subscriber registry and
//! the recovery paths each adapter owns.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use unibus::backends::{MemoryLogCluster, MemorySessionBroker};
    use unibus::{
        handler_fn, new_broker, Backend, BrokerError, BrokerOptions, BrokerServer,
        ConnectionState, DriverType, MqttOptions, Payload, PublishOptions,
    };

    use crate::integration::fixtures::{
        assert_quiet, fast_options, group, recv, wait_until, ALL_DRIVERS,
    };

    // =============================================================================
    // CONNECTION STATE
    // =============================================================================

    #[tokio::test]
    async fn test_publish_before_connect_is_rejected_everywhere() -> anyhow::Result<()> {
        for driver in ALL_DRIVERS {
            let broker = new_broker(Backend::reference(driver), fast_options())?;
            assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
            let err = broker
                .publish("orders", Payload::from("early"), PublishOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err, BrokerError::NotConnected, "{driver}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() -> anyhow::Result<()> {
        for driver in ALL_DRIVERS {
            let broker = new_broker(Backend::reference(driver), fast_options())?;
            broker.connect().await?;
            broker.connect().await?;
            assert_eq!(broker.connection_state(), ConnectionState::Connected, "{driver}");
            broker.disconnect().await?;
            broker.disconnect().await?;
            assert_eq!(broker.connection_state(), ConnectionState::Disconnected, "{driver}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connection_error() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        cluster.set_reachable(false);
        let broker = new_broker(Backend::Log(Arc::new(cluster)), BrokerOptions::default())?;
        let err = broker.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
        Ok(())
    }

    // =============================================================================
    // DRIVER SELECTION
    // =============================================================================

    #[test]
    fn test_driver_selected_from_configured_name() -> anyhow::Result<()> {
        let cases = [
            ("memory", "memory"),
            ("kafka", "kafka"),
            ("amqp", "rabbitmq"),
            ("mqtt", "mqtt"),
        ];
        for (configured, system) in cases {
            let driver: DriverType = configured.parse()?;
            let broker = new_broker(Backend::reference(driver), BrokerOptions::default())?;
            assert_eq!(broker.name(), system);
        }
        Ok(())
    }

    #[test]
    fn test_default_addresses_per_driver() -> anyhow::Result<()> {
        let log = new_broker(Backend::reference(DriverType::Log), BrokerOptions::default())?;
        assert_eq!(log.address(), "127.0.0.1:9092");

        let options = BrokerOptions::builder()
            .addresses(["kafka-1:9092", "kafka-2:9092"])
            .build()?;
        let log = new_broker(Backend::reference(DriverType::Log), options)?;
        assert_eq!(log.address(), "kafka-1:9092,kafka-2:9092");
        Ok(())
    }

    #[test]
    fn test_invalid_options_rejected_before_construction() {
        let err = BrokerOptions::builder().codec("xml").build().unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
    }

    // =============================================================================
    // SERVER REGISTRY
    // =============================================================================

    /// A second registration on a topic replaces the first subscription.
    #[tokio::test]
    async fn test_server_replaces_subscriber_for_topic() -> anyhow::Result<()> {
        for driver in ALL_DRIVERS {
            let broker = new_broker(Backend::reference(driver), fast_options())?;
            let server = BrokerServer::new(Arc::clone(&broker));

            let (old_tx, mut old_rx) = mpsc::unbounded_channel();
            server
                .register_subscriber(
                    "invoices",
                    handler_fn(move |_| {
                        let _ = old_tx.send(());
                        Ok(())
                    }),
                    None,
                    group("ledger", true),
                )
                .await?;
            assert!(server.subscribers().is_empty(), "{driver}: queued until start");

            server.start().await?;
            let first = server.subscribers().remove("invoices").expect("registered");

            let (new_tx, mut new_rx) = mpsc::unbounded_channel();
            server
                .register_subscriber(
                    "invoices",
                    handler_fn(move |p| {
                        let _ = new_tx.send(p.topic().to_string());
                        Ok(())
                    }),
                    None,
                    group("ledger", true),
                )
                .await?;

            assert!(first.is_closed(), "{driver}");
            assert_eq!(server.subscribers().len(), 1, "{driver}");

            broker
                .publish("invoices", Payload::from("inv-3"), PublishOptions::default())
                .await?;
            assert_eq!(recv(&mut new_rx).await, "invoices", "{driver}");
            assert_quiet(&mut old_rx, Duration::from_millis(100)).await;

            server.stop().await?;
            assert!(server.subscribers().is_empty(), "{driver}");
            assert_eq!(broker.connection_state(), ConnectionState::Disconnected, "{driver}");
        }
        Ok(())
    }

    // =============================================================================
    // RECOVERY
    // =============================================================================

    /// A rejected send on the cached producer is retried on a fresh one.
    #[tokio::test]
    async fn test_producer_recreated_once_after_failed_send() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        cluster.fail_next_sends(1);
        broker
            .publish("orders", Payload::from("o-1"), PublishOptions::default())
            .await?;
        assert_eq!(cluster.producers_created(), 2);
        assert_eq!(cluster.open_producers(), 1);
        assert_eq!(cluster.records("orders").len(), 1);
        Ok(())
    }

    /// A persistent session keeps its filters across refused reconnects.
    #[tokio::test]
    async fn test_mqtt_reconnects_after_refused_attempts() -> anyhow::Result<()> {
        let session = MemorySessionBroker::new();
        let client = session.client();
        let options = BrokerOptions::builder()
            .mqtt(MqttOptions {
                client_id: Some("plant-floor-7".into()),
                clean_session: false,
                reconnect_interval: Duration::from_millis(10),
                ..MqttOptions::default()
            })
            .build()?;
        let broker = new_broker(Backend::Mqtt(Arc::new(client.clone())), options)?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "plant/+/alarm",
                handler_fn(move |p| {
                    let _ = tx.send(p.topic().to_string());
                    Ok(())
                }),
                None,
                Default::default(),
            )
            .await?;

        session.refuse_connections(3);
        client.simulate_connection_loss();
        // One initial connect, three refused attempts and the one that lands.
        wait_until(|| {
            client.connect_attempts() == 5
                && broker.connection_state() == ConnectionState::Connected
        })
        .await;
        assert_eq!(client.client_id().as_deref(), Some("plant-floor-7"));
        assert_eq!(client.filters(), vec!["plant/+/alarm".to_string()]);

        broker
            .publish("plant/line-2/alarm", Payload::from("overheat"), PublishOptions::default())
            .await?;
        assert_eq!(recv(&mut rx).await, "plant/line-2/alarm");
        Ok(())
    }
}
