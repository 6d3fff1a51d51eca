//! # Batch Delivery
//!
//! A batched subscription hands its handler up to `batch_size` records in
//! partition order, flushing early once `batch_interval` has passed since
//! the first buffered record.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use unibus::backends::MemoryLogCluster;
    use unibus::{
        new_broker, Backend, Broker, BrokerError, BrokerOptions, Handler, Payload, Publication,
        PublishOptions, SubscribeOptions,
    };

    use crate::integration::fixtures::{assert_quiet, recv};

    /// Records each batch as the list of its payloads.
    struct BatchRecorder {
        batches: mpsc::UnboundedSender<Vec<String>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Handler for BatchRecorder {
        async fn handle(&self, publication: &Publication) -> Result<(), BrokerError> {
            self.handle_batch(std::slice::from_ref(publication)).await
        }

        async fn handle_batch(&self, batch: &[Publication]) -> Result<(), BrokerError> {
            *self.calls.lock() += 1;
            let payloads = batch
                .iter()
                .filter_map(|p| p.body().as_raw())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect();
            let _ = self.batches.send(payloads);
            Ok(())
        }
    }

    fn batched(size: usize, interval: Duration) -> SubscribeOptions {
        SubscribeOptions::builder()
            .queue_name("aggregators")
            .batch_size(size)
            .batch_interval(interval)
            .max_wait(Duration::from_millis(20))
            .build()
            .expect("valid batch options")
    }

    async fn publish_all(broker: &Arc<dyn Broker>, payloads: &[&'static str]) -> anyhow::Result<()> {
        for payload in payloads {
            broker
                .publish("metrics", Payload::from(*payload), PublishOptions::default())
                .await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_interval() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "metrics",
                Arc::new(BatchRecorder {
                    batches: tx,
                    calls: Mutex::new(0),
                }),
                None,
                batched(3, Duration::from_secs(30)),
            )
            .await?;

        publish_all(&broker, &["m1", "m2", "m3"]).await?;
        assert_eq!(recv(&mut rx).await, vec!["m1", "m2", "m3"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_interval() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "metrics",
                Arc::new(BatchRecorder {
                    batches: tx,
                    calls: Mutex::new(0),
                }),
                None,
                batched(10, Duration::from_millis(100)),
            )
            .await?;

        publish_all(&broker, &["m1", "m2"]).await?;
        assert_eq!(recv(&mut rx).await, vec!["m1", "m2"]);
        assert_quiet(&mut rx, Duration::from_millis(250)).await;

        // A full commit after each batch leaves no lag behind.
        assert_eq!(cluster.consumer_lag("aggregators", "metrics"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsubscribe_flushes_pending_batch() -> anyhow::Result<()> {
        let cluster = MemoryLogCluster::new();
        let broker = new_broker(Backend::Log(Arc::new(cluster.clone())), BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(BatchRecorder {
            batches: tx,
            calls: Mutex::new(0),
        });

        let sub = broker
            .subscribe(
                "metrics",
                Arc::clone(&recorder) as Arc<dyn Handler>,
                None,
                batched(10, Duration::from_secs(30)),
            )
            .await?;

        publish_all(&broker, &["m1"]).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.unsubscribe(false).await?;

        assert_eq!(recv(&mut rx).await, vec!["m1"]);
        assert_eq!(*recorder.calls.lock(), 1);
        Ok(())
    }
}
