//! In-process pub/sub adapter.
//!
//! One `tokio::sync::broadcast` channel per topic gives multi-producer,
//! multi-consumer fan-out. Deliveries carry no commit step, subscriptions
//! match topics exactly, and reconnection is left to the caller. A topic's
//! channel is dropped once its last subscription is torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use unibus_telemetry::metrics;

use super::common::{AdapterCore, Dispatcher, Incoming};
use crate::domain::{
    Binder, BrokerError, BrokerOptions, ConnectionState, Delivery, Headers, Payload,
    PublishOptions, SendReceipt, SubscribeOptions,
};
use crate::ports::{Broker, Handler};
use crate::subscriber::{Subscriber, Teardown};

/// Maximum messages buffered per subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

const SYSTEM: &str = "memory";
const ADDRESS: &str = "memory://local";

type Channels = Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>;

#[derive(Debug, Clone)]
struct Envelope {
    topic: String,
    headers: Headers,
    payload: Bytes,
    sequence: u64,
}

/// In-memory broker.
pub struct MemoryBroker {
    core: AdapterCore,
    channels: Channels,
    published: AtomicU64,
    capacity: usize,
}

impl MemoryBroker {
    #[must_use]
    pub fn new(options: BrokerOptions) -> Self {
        Self::with_capacity(options, DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(options: BrokerOptions, capacity: usize) -> Self {
        Self {
            core: AdapterCore::new(SYSTEM, options),
            channels: Arc::new(RwLock::new(HashMap::new())),
            published: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Messages published since construction, delivered or not.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Live receivers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Topics with a live channel.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.channels.read().len()
    }

    /// A new receiver on `topic`, created under the write lock so a
    /// concurrent prune cannot orphan it.
    fn receiver(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.channels
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

/// Drops a topic's channel once no receiver is left on it.
struct ChannelTeardown {
    channels: Channels,
    topic: String,
}

#[async_trait]
impl Teardown for ChannelTeardown {
    async fn teardown(&self) -> Result<(), BrokerError> {
        let mut channels = self.channels.write();
        if channels
            .get(&self.topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&self.topic);
            debug!(topic = %self.topic, "Channel dropped");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        SYSTEM
    }

    fn address(&self) -> String {
        self.core.options().address_or(ADDRESS)
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
        if self.core.state().set(ConnectionState::Connected) != ConnectionState::Connected {
            info!(system = SYSTEM, "Broker connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.core.state().get() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self
            .core
            .shutdown(async {
                self.channels.write().clear();
                Vec::new()
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
        let payload = self.core.encode(payload)?;

        let bridge = self.core.bridge();
        let mut headers = options.headers;
        let span = bridge.start_producer_span(topic, &mut headers, options.trace_context.as_ref());

        let sequence = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            topic: topic.to_string(),
            headers,
            payload,
            sequence,
        };

        let sender = self.channels.read().get(topic).cloned();
        match sender.map(|s| s.send(envelope)) {
            Some(Ok(receivers)) => {
                debug!(topic, receivers, "Message published");
            }
            _ => {
                warn!(topic, "Message dropped (no receivers)");
            }
        }

        metrics::record_published(SYSTEM, topic);
        let receipt = SendReceipt {
            message_id: sequence.to_string(),
            partition: None,
        };
        bridge.finish_producer_span(span, Ok(&receipt));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<Subscriber, BrokerError> {
        self.core.ensure_connected()?;

        let receiver = self.receiver(topic);
        let dispatcher = self.core.dispatcher(handler, binder, options.clone());
        let teardown = ChannelTeardown {
            channels: Arc::clone(&self.channels),
            topic: topic.to_string(),
        };
        let queue_name = options.queue_name().map(str::to_string);
        let (subscriber, shutdown) =
            Subscriber::new(topic, queue_name, options, Some(Box::new(teardown)));

        subscriber.set_task(tokio::spawn(receive_loop(receiver, dispatcher, shutdown)));
        self.core.track(&subscriber);

        debug!(topic, "New subscription created");
        Ok(subscriber)
    }
}

async fn receive_loop(
    mut receiver: broadcast::Receiver<Envelope>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = receiver.recv() => match received {
                Ok(envelope) => {
                    let incoming = Incoming {
                        message_id: Some(envelope.sequence.to_string()),
                        topic: envelope.topic.clone(),
                        headers: envelope.headers.clone(),
                        payload: envelope.payload.clone(),
                        delivery: Delivery::None,
                        partition: None,
                        raw: Box::new(envelope),
                        acker: None,
                    };
                    // Failures are logged and counted by the dispatcher.
                    let _ = dispatcher.deliver(incoming).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
