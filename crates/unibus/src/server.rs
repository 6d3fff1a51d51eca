//! Lifecycle owner for one broker and its registered subscriptions.
//!
//! ```text
//!   register_subscriber ──(not started)──▶ pending
//!          │                                  │ start(): init → connect → subscribe
//!          └──(started)──▶ subscribe ─────────┴─▶ SubscriberRegistry (one per topic)
//!                                                        │ stop(): unsubscribe all → disconnect
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::domain::{binder, Binder, BrokerError, ConnectionState, SubscribeOptions};
use crate::ports::{typed_handler, Broker, Handler, TypedEvent};
use crate::subscriber::{Subscriber, SubscriberRegistry};

struct PendingSubscription {
    handler: Arc<dyn Handler>,
    binder: Option<Binder>,
    options: SubscribeOptions,
}

/// Holds one broker, starts and stops it, and keeps at most one
/// subscription per topic.
pub struct BrokerServer {
    broker: Arc<dyn Broker>,
    registry: Arc<SubscriberRegistry>,
    pending: Mutex<HashMap<String, PendingSubscription>>,
    started: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl BrokerServer {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: SubscriberRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.broker.name()
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Registry snapshot keyed by topic.
    #[must_use]
    pub fn subscribers(&self) -> HashMap<String, Subscriber> {
        self.registry.snapshot()
    }

    /// Subscribe `handler` to `topic`, now if started, otherwise on `start`.
    ///
    /// A later registration for the same topic replaces the earlier one and
    /// closes its subscription.
    pub async fn register_subscriber(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<(), BrokerError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_started() {
            self.pending.lock().insert(
                topic.to_string(),
                PendingSubscription {
                    handler,
                    binder,
                    options,
                },
            );
            info!(broker = self.name(), topic, "Subscription queued until start");
            return Ok(());
        }
        self.subscribe_now(topic, handler, binder, options).await
    }

    /// Typed variant of [`register_subscriber`](Self::register_subscriber).
    pub async fn register_typed<T, F, Fut>(
        &self,
        topic: &str,
        f: F,
        options: SubscribeOptions,
    ) -> Result<(), BrokerError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(TypedEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        self.register_subscriber(topic, typed_handler(f), Some(binder::<T>()), options)
            .await
    }

    async fn subscribe_now(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<(), BrokerError> {
        let subscriber = self.broker.subscribe(topic, handler, binder, options).await?;
        if let Some(replaced) = self.registry.insert(subscriber) {
            if let Err(err) = replaced.unsubscribe(false).await {
                warn!(broker = self.name(), topic, error = %err, "Replaced subscriber teardown failed");
            }
        }
        info!(broker = self.name(), topic, "Subscriber registered");
        Ok(())
    }

    /// Apply options, connect and subscribe every queued registration.
    ///
    /// Individual subscribe failures are logged and do not fail the start.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        if self.broker.connection_state() == ConnectionState::Disconnected {
            self.broker.init(self.broker.options()).await?;
        }
        self.broker.connect().await?;

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (topic, registration) in pending {
            if let Err(err) = self
                .subscribe_now(
                    &topic,
                    registration.handler,
                    registration.binder,
                    registration.options,
                )
                .await
            {
                error!(broker = self.name(), topic = %topic, error = %err, "Subscribe on start failed");
            }
        }

        self.started.store(true, Ordering::Release);
        info!(
            broker = self.name(),
            address = %self.broker.address(),
            subscribers = self.registry.len(),
            "Broker server started"
        );
        Ok(())
    }

    /// Unsubscribe everything, then disconnect.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let _guard = self.lifecycle.lock().await;
        let subscribers = self.registry.drain();
        let results = join_all(subscribers.iter().map(|s| s.unsubscribe(false))).await;
        for (subscriber, result) in subscribers.iter().zip(results) {
            if let Err(err) = result {
                warn!(broker = self.name(), topic = %subscriber.topic(), error = %err, "Unsubscribe on stop failed");
            }
        }

        self.started.store(false, Ordering::Release);
        let result = self.broker.disconnect().await;
        info!(broker = self.name(), "Broker server stopped");
        result
    }
}
