//! The broker contract every adapter implements.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::handler::{typed_handler, Handler, TypedEvent};
use crate::domain::{
    binder, Binder, BrokerError, BrokerOptions, ConnectionState, Payload, PublishOptions,
    SubscribeOptions,
};
use crate::subscriber::Subscriber;

/// Uniform publish/subscribe contract over one backend.
///
/// ## Lifecycle
///
/// `init` (optional, only while disconnected) → `connect` → any number of
/// `publish`/`subscribe` → `disconnect`. `connect` and `disconnect` are
/// idempotent.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend label, e.g. `kafka`.
    fn name(&self) -> &'static str;

    /// Configured addresses, or the backend default.
    fn address(&self) -> String;

    /// Snapshot of the applied options.
    fn options(&self) -> BrokerOptions;

    fn connection_state(&self) -> ConnectionState;

    /// Validate and apply options. Fails while connected.
    async fn init(&self, options: BrokerOptions) -> Result<(), BrokerError>;

    async fn connect(&self) -> Result<(), BrokerError>;

    /// Tear down subscriptions, producers and sessions; failures are collected.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Start a receive loop; without a binder handlers see raw bytes.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<Subscriber, BrokerError>;
}

/// Typed conveniences available on every broker.
#[async_trait]
pub trait BrokerExt: Broker {
    /// Publish any serializable value through the configured codec.
    async fn publish_value<T>(
        &self,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<(), BrokerError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = Payload::from_value(value)?;
        self.publish(topic, payload, options).await
    }

    /// Subscribe a closure that receives values decoded as `T`.
    async fn subscribe_typed<T, F, Fut>(
        &self,
        topic: &str,
        f: F,
        options: SubscribeOptions,
    ) -> Result<Subscriber, BrokerError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(TypedEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        self.subscribe(topic, typed_handler(f), Some(binder::<T>()), options)
            .await
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}
