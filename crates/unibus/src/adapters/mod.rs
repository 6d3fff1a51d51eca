//! Backend adapters implementing [`Broker`](crate::ports::Broker).
//!
//! | Adapter | Ack | Scope | Reconnect | Batching | Producer |
//! |---------|-----|-------|-----------|----------|----------|
//! | [`MemoryBroker`] | auto, no commit | exact topic | caller | one-per-invocation | n/a |
//! | [`LogBroker`] | commit (partition, offset) | consumer group | caller | size or interval | cached per topic |
//! | [`QueueBroker`] | delivery tag | queue binding | caller | one-per-invocation | stateless |
//! | [`MqttBroker`] | QoS 1 packet id | wildcard filter | adapter loop | one-per-invocation | stateless |

pub(crate) mod common;
pub mod log;
pub mod memory;
pub mod mqtt;
pub mod queue;

pub use log::LogBroker;
pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;
pub use queue::QueueBroker;
