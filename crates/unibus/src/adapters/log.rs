//! Partitioned log adapter (Kafka-style).
//!
//! | Concern | Behaviour |
//! |---------|-----------|
//! | Ack | commit of `(partition, offset)` through the group's committer |
//! | Scope | named consumer group sharing the topic's partitions |
//! | Reconnect | caller re-invokes `connect` |
//! | Batching | dual-trigger batches when `batch_size > 1` |
//! | Producers | one cached producer per topic, recreated once on failure |
//!
//! Publishing is synchronous by default. With `LogOptions::async_publish`
//! the send runs on a spawned task and its outcome goes to
//! `LogOptions::completion`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use unibus_telemetry::metrics;

use super::common::{backoff, sleep_until_opt, AdapterCore, Dispatcher, Incoming};
use crate::domain::{
    Acknowledger, BatchBuffer, Binder, BrokerError, BrokerOptions, ConnectionState, Delivery,
    Payload, ProducerCache, ProducerFactory, PublishOptions, RequiredAcks, SendReceipt,
    SubscribeOptions,
};
use crate::ports::{
    Broker, Handler, LogCluster, LogProducer, LogReader, LogRecord, OffsetCommitter,
    OutboundRecord, ProducerConfig, ReaderConfig,
};
use crate::subscriber::Subscriber;

const SYSTEM: &str = "kafka";

/// Address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9092";

/// Creates per-topic producers on the cluster.
pub struct LogProducerFactory {
    cluster: Arc<dyn LogCluster>,
    required_acks: RequiredAcks,
}

#[async_trait]
impl ProducerFactory for LogProducerFactory {
    type Producer = dyn LogProducer;

    async fn create(&self, topic: &str) -> Result<Arc<dyn LogProducer>, BrokerError> {
        self.cluster
            .producer(ProducerConfig {
                topic: topic.to_string(),
                required_acks: self.required_acks,
            })
            .await
            .map_err(BrokerError::from)
    }

    async fn shutdown(&self, producer: Arc<dyn LogProducer>) -> Result<(), BrokerError> {
        producer.close().await.map_err(BrokerError::from)
    }
}

type Producers = ProducerCache<LogProducerFactory>;

struct OffsetAcker {
    committer: Arc<dyn OffsetCommitter>,
}

impl Acknowledger for OffsetAcker {
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        match *delivery {
            Delivery::Offset { partition, offset } => self
                .committer
                .commit(partition, offset)
                .map_err(BrokerError::from),
            other => Err(BrokerError::Protocol(format!(
                "cannot commit {other:?} on a partitioned log"
            ))),
        }
    }
}

/// Broker over a [`LogCluster`].
pub struct LogBroker {
    core: AdapterCore,
    cluster: Arc<dyn LogCluster>,
    producers: RwLock<Option<Arc<Producers>>>,
}

impl LogBroker {
    pub fn new(cluster: Arc<dyn LogCluster>, options: BrokerOptions) -> Self {
        Self {
            core: AdapterCore::new(SYSTEM, options),
            cluster,
            producers: RwLock::new(None),
        }
    }

    fn producers(&self) -> Result<Arc<Producers>, BrokerError> {
        self.producers.read().clone().ok_or(BrokerError::NotConnected)
    }

    /// Producers created since `connect`.
    #[must_use]
    pub fn producers_created(&self) -> usize {
        self.producers.read().as_ref().map_or(0, |p| p.created())
    }

    /// Recover-and-retry cycles since `connect`.
    #[must_use]
    pub fn producer_recoveries(&self) -> usize {
        self.producers.read().as_ref().map_or(0, |p| p.recoveries())
    }
}

async fn send_record(
    producers: &Producers,
    topic: &str,
    record: OutboundRecord,
) -> Result<SendReceipt, BrokerError> {
    let attempts_before = producers.recoveries();
    let result = producers
        .send_with(topic, |producer| {
            let record = record.clone();
            async move { producer.send(record).await.map_err(BrokerError::from) }
        })
        .await;
    if producers.recoveries() > attempts_before {
        metrics::record_producer_recovery(SYSTEM, topic);
    }

    let metadata = result?;
    Ok(SendReceipt {
        message_id: metadata.offset.to_string(),
        partition: Some(metadata.partition),
    })
}

#[async_trait]
impl Broker for LogBroker {
    fn name(&self) -> &'static str {
        SYSTEM
    }

    fn address(&self) -> String {
        self.core.options().address_or(DEFAULT_ADDRESS)
    }

    fn options(&self) -> BrokerOptions {
        self.core.options()
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state().get()
    }

    async fn init(&self, options: BrokerOptions) -> Result<(), BrokerError> {
        self.core.init(options)
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.core.state().is_connected() {
            return Ok(());
        }
        let options = self.core.options();
        let addresses = if options.addresses().is_empty() {
            vec![DEFAULT_ADDRESS.to_string()]
        } else {
            options.addresses().to_vec()
        };

        self.cluster
            .connect(&addresses, options.tls())
            .await
            .map_err(|e| e.into_connection())?;

        *self.producers.write() = Some(Arc::new(ProducerCache::new(LogProducerFactory {
            cluster: Arc::clone(&self.cluster),
            required_acks: options.log().required_acks,
        })));
        self.core.state().set(ConnectionState::Connected);
        info!(system = SYSTEM, addresses = ?addresses, "Broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.core.state().get() == ConnectionState::Disconnected {
            return Ok(());
        }
        let producers = self.producers.write().take();
        let result = self
            .core
            .shutdown(async {
                let mut errors = match producers {
                    Some(producers) => producers.close_all().await,
                    None => Vec::new(),
                };
                if let Err(err) = self.cluster.close().await {
                    errors.push(err.into());
                }
                errors
            })
            .await;
        info!(system = SYSTEM, "Broker disconnected");
        result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        self.core.ensure_connected()?;
        let producers = self.producers()?;
        let value = self.core.encode(payload)?;

        let bridge = self.core.bridge();
        let mut headers = options.headers;
        let span = bridge.start_producer_span(topic, &mut headers, options.trace_context.as_ref());
        let record = OutboundRecord {
            key: options.key,
            headers,
            value,
        };

        let log_options = self.core.options().log().clone();
        if log_options.async_publish {
            let topic = topic.to_string();
            tokio::spawn(async move {
                let result = send_record(&producers, &topic, record).await;
                bridge.finish_producer_span(span, result.as_ref());
                match &result {
                    Ok(_) => metrics::record_published(SYSTEM, &topic),
                    Err(err) => {
                        metrics::record_publish_failure(SYSTEM, &topic);
                        if log_options.completion.is_none() {
                            error!(topic = %topic, error = %err, "Async publish failed");
                        }
                    }
                }
                if let Some(completion) = &log_options.completion {
                    completion(&topic, result);
                }
            });
            return Ok(());
        }

        let result = send_record(&producers, topic, record).await;
        bridge.finish_producer_span(span, result.as_ref());
        match result {
            Ok(receipt) => {
                metrics::record_published(SYSTEM, topic);
                debug!(topic, partition = ?receipt.partition, offset = %receipt.message_id, "Message published");
                Ok(())
            }
            Err(err) => {
                metrics::record_publish_failure(SYSTEM, topic);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<Subscriber, BrokerError> {
        self.core.ensure_connected()?;

        let group = options
            .queue_name()
            .map(str::to_string)
            .or_else(|| self.core.options().queue_name().map(str::to_string))
            .ok_or_else(|| {
                BrokerError::Configuration(
                    "log subscriptions require a consumer group (queue name)".into(),
                )
            })?;

        let reader = self
            .cluster
            .reader(ReaderConfig {
                topic: topic.to_string(),
                group: group.clone(),
                min_bytes: options.min_read_bytes(),
                max_bytes: options.max_read_bytes(),
                max_wait: options.max_wait(),
                read_lag_interval: options.read_lag_interval(),
            })
            .await
            .map_err(BrokerError::from)?;

        let acker: Arc<dyn Acknowledger> = Arc::new(OffsetAcker {
            committer: reader.committer(),
        });
        let dispatcher = self.core.dispatcher(handler, binder, options.clone());
        let (subscriber, shutdown) = Subscriber::new(topic, Some(group.clone()), options, None);

        subscriber.set_task(tokio::spawn(consume_loop(reader, dispatcher, acker, shutdown)));
        self.core.track(&subscriber);

        info!(topic, group = %group, "Consumer group subscription started");
        Ok(subscriber)
    }
}

fn incoming(record: LogRecord, acker: &Arc<dyn Acknowledger>) -> Incoming {
    Incoming {
        topic: record.topic.clone(),
        headers: record.headers.clone(),
        payload: record.value.clone(),
        delivery: Delivery::Offset {
            partition: record.partition,
            offset: record.offset,
        },
        message_id: Some(record.offset.to_string()),
        partition: Some(record.partition),
        raw: Box::new(record),
        acker: Some(Arc::clone(acker)),
    }
}

async fn consume_loop(
    mut reader: Box<dyn LogReader>,
    dispatcher: Dispatcher,
    acker: Arc<dyn Acknowledger>,
    mut shutdown: watch::Receiver<bool>,
) {
    let options = dispatcher.options().clone();
    let mut batch = options
        .is_batched()
        .then(|| BatchBuffer::new(options.batch_size(), options.batch_interval()));

    loop {
        let deadline = batch.as_ref().and_then(BatchBuffer::deadline);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep_until_opt(deadline) => {
                if let Some(items) = batch.as_mut().and_then(|b| b.poll_expired(Instant::now())) {
                    let _ = dispatcher.deliver_batch(items).await;
                }
            }
            fetched = reader.fetch() => match fetched {
                Ok(Some(record)) => {
                    let message = incoming(record, &acker);
                    match batch.as_mut() {
                        Some(buffer) => {
                            if let Some(items) = buffer.push(message, Instant::now()) {
                                let _ = dispatcher.deliver_batch(items).await;
                            }
                        }
                        None => {
                            let _ = dispatcher.deliver(message).await;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Log fetch failed");
                    if !backoff(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    if let Some(items) = batch.as_mut().and_then(BatchBuffer::drain) {
        debug!(size = items.len(), "Flushing partial batch on shutdown");
        let _ = dispatcher.deliver_batch(items).await;
    }
    if let Err(err) = reader.close().await {
        warn!(error = %err, "Log reader close failed");
    }
}
