//! Ports: the broker contract, handlers, and native client traits.

pub mod broker;
pub mod clients;
pub mod handler;

pub use broker::{Broker, BrokerExt};
pub use clients::{
    DeliveryAcker, LogCluster, LogProducer, LogReader, LogRecord, OffsetCommitter,
    OutboundRecord, ProducerConfig, QueueBinding, QueueConnection, QueueConsumer,
    QueueDelivery, ReaderConfig, RecordMetadata, SessionClient, SessionConfig, SessionEvent,
    SessionMessage,
};
pub use handler::{handler_fn, raw_handler, typed_handler, Handler, RawEvent, TypedEvent};
