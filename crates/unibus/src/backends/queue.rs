//! In-process exchange/queue broker implementing [`QueueConnection`].
//!
//! Exchanges are direct: a message reaches every queue bound with a routing
//! key equal to the one it was published with. Each consumer holds at most
//! `prefetch` unacknowledged deliveries; cancelling a consumer puts its
//! unacknowledged deliveries back at the head of the queue, flagged
//! `redelivered`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::{BackendError, Headers, TlsOptions};
use crate::ports::{DeliveryAcker, QueueBinding, QueueConnection, QueueConsumer, QueueDelivery};

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    headers: Headers,
    body: Bytes,
    redelivered: bool,
}

#[derive(Default)]
struct QueueEntry {
    bindings: HashSet<(String, String)>,
    durable: bool,
    exclusive_owner: Option<u64>,
    consumers: Vec<u64>,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, (u64, Stored)>,
}

impl QueueEntry {
    fn in_flight(&self, consumer: u64) -> usize {
        self.unacked.values().filter(|(c, _)| *c == consumer).count()
    }
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    connected: bool,
    sequence: u64,
    next_consumer: u64,
    next_tag: u64,
    queues: HashMap<String, QueueEntry>,
}

/// Shared handle to an in-process queue broker. Clones see the same queues.
#[derive(Clone, Default)]
pub struct MemoryQueueBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl MemoryQueueBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Declared queue names, sorted.
    #[must_use]
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliveries waiting in `queue`.
    #[must_use]
    pub fn ready(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out on `queue` but not yet acknowledged.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }
}

#[async_trait]
impl QueueConnection for MemoryQueueBroker {
    async fn connect(
        &self,
        addresses: &[String],
        _tls: Option<&TlsOptions>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(BackendError::Unreachable(addresses.join(",")));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.lock().connected = false;
        self.changed.notify_waiters();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) -> Result<u64, BackendError> {
        let sequence = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BackendError::SessionClosed);
            }
            state.sequence += 1;

            let route = (exchange.to_string(), routing_key.to_string());
            let mut routed = 0;
            for queue in state.queues.values_mut() {
                if queue.bindings.contains(&route) {
                    queue.ready.push_back(Stored {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        headers: headers.clone(),
                        body: body.clone(),
                        redelivered: false,
                    });
                    routed += 1;
                }
            }
            if routed == 0 {
                debug!(exchange, routing_key, "Unroutable message discarded");
            }
            state.sequence
        };
        self.changed.notify_waiters();
        Ok(sequence)
    }

    async fn consume(
        &self,
        binding: QueueBinding,
        prefetch: u16,
    ) -> Result<Box<dyn QueueConsumer>, BackendError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BackendError::SessionClosed);
        }
        state.next_consumer += 1;
        let consumer = state.next_consumer;

        let queue = state.queues.entry(binding.queue.clone()).or_insert_with(|| QueueEntry {
            durable: binding.durable,
            ..QueueEntry::default()
        });
        if queue.exclusive_owner.is_some() || (binding.exclusive && !queue.consumers.is_empty()) {
            return Err(BackendError::Rejected(format!(
                "queue '{}' is locked by an exclusive consumer",
                binding.queue
            )));
        }
        queue
            .bindings
            .insert((binding.exchange.clone(), binding.routing_key.clone()));
        queue.consumers.push(consumer);
        if binding.exclusive {
            queue.exclusive_owner = Some(consumer);
        }
        debug!(queue = %binding.queue, consumer, prefetch, "Consumer attached");

        Ok(Box::new(MemoryQueueConsumer {
            broker: self.clone(),
            queue: binding.queue,
            consumer,
            prefetch: usize::from(prefetch),
            cancelled: false,
        }))
    }
}

struct MemoryQueueConsumer {
    broker: MemoryQueueBroker,
    queue: String,
    consumer: u64,
    prefetch: usize,
    cancelled: bool,
}

impl MemoryQueueConsumer {
    fn try_next(&self) -> Result<Option<QueueDelivery>, BackendError> {
        let mut state = self.broker.state.lock();
        if !state.connected {
            return Err(BackendError::SessionClosed);
        }
        let tag = state.next_tag + 1;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BackendError::Rejected(format!("queue '{}' deleted", self.queue)));
        };
        if self.prefetch > 0 && queue.in_flight(self.consumer) >= self.prefetch {
            return Ok(None);
        }
        let Some(stored) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.unacked.insert(tag, (self.consumer, stored.clone()));
        state.next_tag = tag;

        Ok(Some(QueueDelivery {
            delivery_tag: tag,
            exchange: stored.exchange,
            routing_key: stored.routing_key,
            headers: stored.headers,
            body: stored.body,
            redelivered: stored.redelivered,
        }))
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    async fn next(&mut self) -> Result<Option<QueueDelivery>, BackendError> {
        loop {
            if self.cancelled {
                return Ok(None);
            }
            let changed = Arc::clone(&self.broker.changed);
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next()? {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    fn acker(&self) -> Arc<dyn DeliveryAcker> {
        Arc::new(QueueAcker {
            broker: self.broker.clone(),
            queue: self.queue.clone(),
            consumer: self.consumer,
        })
    }

    async fn cancel(&mut self) -> Result<(), BackendError> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        {
            let mut state = self.broker.state.lock();
            let Some(queue) = state.queues.get_mut(&self.queue) else {
                return Ok(());
            };

            let mut returned: Vec<_> = queue
                .unacked
                .iter()
                .filter(|(_, (c, _))| *c == self.consumer)
                .map(|(tag, _)| *tag)
                .collect();
            returned.sort_unstable();
            for tag in returned.iter().rev() {
                if let Some((_, mut stored)) = queue.unacked.remove(tag) {
                    stored.redelivered = true;
                    queue.ready.push_front(stored);
                }
            }

            queue.consumers.retain(|c| *c != self.consumer);
            if queue.exclusive_owner == Some(self.consumer) {
                queue.exclusive_owner = None;
            }
            let delete = !queue.durable && queue.consumers.is_empty();
            debug!(queue = %self.queue, requeued = returned.len(), "Consumer cancelled");
            if delete {
                state.queues.remove(&self.queue);
                debug!(queue = %self.queue, "Auto-deleted queue");
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

struct QueueAcker {
    broker: MemoryQueueBroker,
    queue: String,
    consumer: u64,
}

impl DeliveryAcker for QueueAcker {
    fn ack(&self, delivery_tag: u64) -> Result<(), BackendError> {
        {
            let mut state = self.broker.state.lock();
            if !state.connected {
                return Err(BackendError::SessionClosed);
            }
            let owned = state
                .queues
                .get_mut(&self.queue)
                .filter(|q| {
                    q.unacked
                        .get(&delivery_tag)
                        .is_some_and(|(c, _)| *c == self.consumer)
                })
                .and_then(|q| q.unacked.remove(&delivery_tag));
            if owned.is_none() {
                return Err(BackendError::Rejected(format!(
                    "unknown delivery tag {delivery_tag}"
                )));
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }
}
