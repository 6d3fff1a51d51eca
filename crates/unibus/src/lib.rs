//! # Unibus - One Publish/Subscribe Contract Over Many Brokers
//!
//! Application code talks to [`Broker`]; adapters reconcile each backend's
//! notion of "connected", "acknowledged" and "subscribed" behind it.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────┐  publish(topic, payload)   ┌──────────────┐   encode    ┌─────────────┐
//!  │ Application │ ─────────────────────────▶ │   Adapter    │ ──────────▶ │  Native     │
//!  │             │                            │ (Broker impl)│  span+inject│  client port│
//!  │  Handler    │ ◀───────────────────────── │              │ ◀────────── │             │
//!  └─────────────┘  Publication (decoded,     └──────────────┘  extract,   └─────────────┘
//!                    ack bound to delivery)                     decode
//! ```
//!
//! ## Layout
//!
//! - `domain/` - messages, codecs, options, batching, producer cache, errors
//! - `ports/` - the [`Broker`] contract, handlers, native client traits
//! - `adapters/` - memory, partitioned log, exchange/queue, MQTT session
//! - `backends/` - in-process implementations of every client port
//! - [`server`] - lifecycle owner and subscriber registry wiring
//! - [`driver`] - construction-time adapter selection
//!
//! ## Guarantees
//!
//! - `ack()` commits exactly the coordinates of the delivery it came with.
//! - A failed send on a cached producer is retried once on a fresh producer.
//! - Batches flush on size or interval, whichever comes first.
//! - The MQTT adapter reconnects on its own; the others leave it to the caller.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod backends;
pub mod domain;
pub mod driver;
pub mod ports;
pub mod server;
pub mod subscriber;
pub mod tracing_bridge;

pub use adapters::{LogBroker, MemoryBroker, MqttBroker, QueueBroker};
pub use domain::{
    binder, Binder, Body, BrokerError, BrokerOptions, Codec, CodecRegistry, ConnectionState,
    Delivery, HandlerErrorPolicy, Headers, Message, MqttOptions, Payload, Publication, PublishOptions,
    SendReceipt, SubscribeOptions,
};
pub use driver::{new_broker, Backend, DriverType};
pub use ports::{handler_fn, raw_handler, typed_handler, Broker, BrokerExt, Handler};
pub use server::BrokerServer;
pub use subscriber::{Subscriber, SubscriberRegistry};
pub use tracing_bridge::TracingBridge;
