//! Pure types and policies shared by every adapter.

pub mod batch;
pub mod codec;
pub mod errors;
pub mod message;
pub mod options;
pub mod producer_cache;
pub mod publication;
pub mod state;
pub mod topic;

pub use batch::BatchBuffer;
pub use codec::{binder, BindTarget, Binder, Codec, CodecRegistry, JsonCodec, MsgPackCodec};
pub use errors::{BackendError, BrokerError};
pub use message::{Body, Delivery, Headers, Message, Payload, SendReceipt};
pub use options::{
    BrokerOptions, BrokerOptionsBuilder, CompletionFn, Credentials, HandlerErrorPolicy,
    LogOptions, MqttOptions, PublishOptions, QoS, QueueOptions, RequiredAcks, SubscribeOptions,
    SubscribeOptionsBuilder, TlsOptions, TracerOptions,
};
pub use producer_cache::{ProducerCache, ProducerFactory};
pub use publication::{Acknowledger, Publication};
pub use state::{ConnectionState, StateCell};
pub use topic::TopicFilter;
