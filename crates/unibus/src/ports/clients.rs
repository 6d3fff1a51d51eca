//! Native client ports.
//!
//! Each adapter reaches its backend only through one of these traits. The
//! wire clients behind them own framing, pooling and retries at the socket
//! level; adapters own the contract semantics on top.
//!
//! | Port | Adapter | Reference backend |
//! |------|---------|-------------------|
//! | [`LogCluster`] | `LogBroker` | `MemoryLogCluster` |
//! | [`QueueConnection`] | `QueueBroker` | `MemoryQueueBroker` |
//! | [`SessionClient`] | `MqttBroker` | `MemorySessionClient` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::domain::{BackendError, Credentials, Headers, QoS, RequiredAcks, TlsOptions};

// =============================================================================
// PARTITIONED LOG
// =============================================================================

/// Record stored at one partition offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub headers: Headers,
    pub value: Bytes,
}

/// Record handed to a producer.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub key: Option<Bytes>,
    pub headers: Headers,
    pub value: Bytes,
}

/// Where a record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub topic: String,
    pub required_acks: RequiredAcks,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub topic: String,
    pub group: String,
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub max_wait: Duration,
    pub read_lag_interval: Option<Duration>,
}

#[async_trait]
pub trait LogCluster: Send + Sync {
    async fn connect(&self, addresses: &[String], tls: Option<&TlsOptions>)
        -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;

    async fn producer(&self, config: ProducerConfig) -> Result<Arc<dyn LogProducer>, BackendError>;

    /// Join `config.group` and return a reader over its assigned partitions.
    async fn reader(&self, config: ReaderConfig) -> Result<Box<dyn LogReader>, BackendError>;
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait LogReader: Send {
    /// Next record, or `None` once `max_wait` passes without one.
    ///
    /// Must be cancel-safe: dropping the future loses no record.
    async fn fetch(&mut self) -> Result<Option<LogRecord>, BackendError>;

    /// Commits for this reader's group.
    fn committer(&self) -> Arc<dyn OffsetCommitter>;

    /// Leave the group. Uncommitted records are redelivered to the next member.
    async fn close(&mut self) -> Result<(), BackendError>;
}

pub trait OffsetCommitter: Send + Sync {
    /// Mark `offset` on `partition` processed.
    fn commit(&self, partition: i32, offset: i64) -> Result<(), BackendError>;
}

// =============================================================================
// EXCHANGE / QUEUE
// =============================================================================

/// Queue declaration and exchange binding for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Bytes,
    pub redelivered: bool,
}

#[async_trait]
pub trait QueueConnection: Send + Sync {
    async fn connect(&self, addresses: &[String], tls: Option<&TlsOptions>)
        -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;

    /// Publish to `exchange`; returns the channel's publish sequence number.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) -> Result<u64, BackendError>;

    /// Declare and bind the queue, then start consuming with `prefetch`.
    async fn consume(
        &self,
        binding: QueueBinding,
        prefetch: u16,
    ) -> Result<Box<dyn QueueConsumer>, BackendError>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// Next delivery; `None` once the consumer is cancelled. Cancel-safe.
    async fn next(&mut self) -> Result<Option<QueueDelivery>, BackendError>;

    fn acker(&self) -> Arc<dyn DeliveryAcker>;

    /// Stop consuming; unacknowledged deliveries return to the queue.
    async fn cancel(&mut self) -> Result<(), BackendError>;
}

pub trait DeliveryAcker: Send + Sync {
    fn ack(&self, delivery_tag: u64) -> Result<(), BackendError>;
}

// =============================================================================
// SESSION (MQTT-STYLE)
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub addresses: Vec<String>,
    pub client_id: String,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
}

#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub topic: String,
    pub packet_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Headers,
    pub payload: Bytes,
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectionLost(String),
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<(), BackendError>;

    async fn disconnect(&self) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        properties: Headers,
        payload: Bytes,
    ) -> Result<(), BackendError>;

    /// Route messages matching `filter` into `sink`.
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        sink: mpsc::Sender<SessionMessage>,
    ) -> Result<(), BackendError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), BackendError>;
}
