//! # Delivery Scenarios
//!
//! The same typed payload, ack and redelivery expectations held against
//! every adapter.
//!
//! | Scenario | Adapters |
//! |----------|----------|
//! | JSON round trip, ack succeeds once | all |
//! | failed manual-ack handler, redelivered to a fresh subscription | log, queue |
//! | auto-ack with `Retain` leaves failures uncommitted | log |
//! | raw-only codec | memory |

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use unibus::backends::{MemoryLogCluster, MemoryQueueBroker};
    use unibus::ports::{QueueDelivery, RawEvent};
    use unibus::{
        binder, handler_fn, new_broker, raw_handler, Backend, BrokerError, BrokerExt,
        BrokerOptions, Delivery, HandlerErrorPolicy, Payload, PublishOptions, SubscribeOptions,
    };

    use crate::integration::fixtures::{
        assert_quiet, fast_options, group, reading, recv, SensorReading, ALL_DRIVERS,
    };

    // =============================================================================
    // TYPED ROUND TRIP
    // =============================================================================

    #[derive(Debug)]
    struct Observed {
        value: Option<SensorReading>,
        first_ack: Result<(), BrokerError>,
        second_ack: Result<(), BrokerError>,
    }

    /// A JSON sensor reading decodes to the published value and acks exactly once.
    #[tokio::test]
    async fn test_sensor_reading_round_trip_on_every_adapter() -> anyhow::Result<()> {
        for driver in ALL_DRIVERS {
            let broker = new_broker(Backend::reference(driver), fast_options())?;
            broker.connect().await?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            let sub = broker
                .subscribe(
                    "sensor.readings",
                    handler_fn(move |p| {
                        let _ = tx.send(Observed {
                            value: p.body().downcast_ref::<SensorReading>().cloned(),
                            first_ack: p.ack(),
                            second_ack: p.ack(),
                        });
                        Ok(())
                    }),
                    Some(binder::<SensorReading>()),
                    group("sensors", false),
                )
                .await?;

            broker
                .publish_value("sensor.readings", &reading(), PublishOptions::default())
                .await?;

            let observed = recv(&mut rx).await;
            assert_eq!(observed.value, Some(reading()), "{driver} decoded value");
            assert!(observed.first_ack.is_ok(), "{driver} first ack");
            assert!(
                matches!(observed.second_ack, Err(BrokerError::Protocol(_))),
                "{driver} second ack must fail"
            );
            assert_quiet(&mut rx, Duration::from_millis(100)).await;

            sub.unsubscribe(false).await?;
            broker.disconnect().await?;
        }
        Ok(())
    }

    /// A structured payload published as JSON text decodes the same way.
    #[tokio::test]
    async fn test_structured_payload_binds_to_type() -> anyhow::Result<()> {
        let broker = new_broker(Backend::Memory, BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe_typed(
                "sensor.readings",
                move |event: unibus::ports::TypedEvent<SensorReading>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((*event.payload).clone());
                        Ok(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await?;

        let json = serde_json::json!({"temperature": 23.5, "humidity": 41.0});
        broker
            .publish("sensor.readings", Payload::from(json), PublishOptions::default())
            .await?;

        assert_eq!(recv(&mut rx).await, reading());
        Ok(())
    }

    // =============================================================================
    // REDELIVERY
    // =============================================================================

    /// An uncommitted offset is read again by the next group member.
    #[tokio::test]
    async fn test_failed_manual_ack_is_redelivered_on_log() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let failing = broker
            .subscribe(
                "audit",
                handler_fn(move |p| {
                    let _ = tx.send(p.delivery());
                    Err(BrokerError::handler("ledger offline"))
                }),
                None,
                group("auditors", false),
            )
            .await?;

        broker
            .publish("audit", Payload::from("entry-1"), PublishOptions::default())
            .await?;
        let first = recv(&mut rx).await;
        failing.unsubscribe(false).await?;
        assert_eq!(cluster.committed_offset("auditors", "audit", 0), None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry = broker
            .subscribe(
                "audit",
                handler_fn(move |p| {
                    let _ = tx.send(p.delivery());
                    p.ack()
                }),
                None,
                group("auditors", false),
            )
            .await?;

        let second = recv(&mut rx).await;
        assert_eq!(first, second);
        assert_eq!(
            second,
            Delivery::Offset {
                partition: 0,
                offset: 0
            }
        );

        retry.unsubscribe(false).await?;
        assert_eq!(cluster.committed_offset("auditors", "audit", 0), Some(1));
        Ok(())
    }

    /// An unacked delivery returns to the queue flagged as redelivered.
    #[tokio::test]
    async fn test_failed_manual_ack_is_redelivered_on_queue() -> anyhow::Result<()> {
        let backend = MemoryQueueBroker::new();
        let broker = new_broker(Backend::Queue(Arc::new(backend.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let failing = broker
            .subscribe(
                "invoices",
                handler_fn(move |_| {
                    let _ = tx.send(());
                    Err(BrokerError::handler("ledger offline"))
                }),
                None,
                group("ledger", false),
            )
            .await?;

        broker
            .publish("invoices", Payload::from("inv-9"), PublishOptions::default())
            .await?;
        recv(&mut rx).await;
        failing.unsubscribe(false).await?;
        assert_eq!(backend.ready("ledger"), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _retry = broker
            .subscribe(
                "invoices",
                handler_fn(move |p| {
                    let redelivered = p
                        .raw()
                        .downcast_ref::<QueueDelivery>()
                        .is_some_and(|d| d.redelivered);
                    let _ = tx.send(redelivered);
                    p.ack()
                }),
                None,
                group("ledger", false),
            )
            .await?;

        assert!(recv(&mut rx).await);
        Ok(())
    }

    /// `Retain` keeps auto-ack from committing a failed delivery.
    #[tokio::test]
    async fn test_retain_policy_leaves_failure_uncommitted() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let options = SubscribeOptions::builder()
            .queue_name("auditors")
            .on_handler_error(HandlerErrorPolicy::Retain)
            .max_wait(Duration::from_millis(50))
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = broker
            .subscribe(
                "audit",
                handler_fn(move |p| {
                    let _ = tx.send(());
                    if p.body().as_raw().is_some_and(|b| b.as_ref() == b"bad") {
                        return Err(BrokerError::handler("rejected"));
                    }
                    Ok(())
                }),
                None,
                options,
            )
            .await?;

        broker
            .publish("audit", Payload::from("bad"), PublishOptions::default())
            .await?;
        recv(&mut rx).await;
        sub.unsubscribe(false).await?;

        assert_eq!(cluster.committed_offset("auditors", "audit", 0), None);
        assert_eq!(cluster.consumer_lag("auditors", "audit"), 1);
        Ok(())
    }

    // =============================================================================
    // RAW MODE
    // =============================================================================

    /// With the codec disabled, handlers receive the published bytes untouched.
    #[tokio::test]
    async fn test_raw_only_codec_passes_bytes_through() -> anyhow::Result<()> {
        let options = BrokerOptions::builder().codec("").build()?;
        let broker = new_broker(Backend::Memory, options)?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "firmware",
                raw_handler(move |event: RawEvent| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event.payload.to_vec());
                        Ok(())
                    }
                }),
                None,
                SubscribeOptions::default(),
            )
            .await?;

        broker
            .publish("firmware", Payload::from(vec![0xde, 0xad, 0xbe, 0xef]), PublishOptions::default())
            .await?;
        assert_eq!(recv(&mut rx).await, vec![0xde, 0xad, 0xbe, 0xef]);

        let err = broker
            .publish("firmware", Payload::from(serde_json::json!({"v": 2})), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Marshal(_)));
        Ok(())
    }
}
