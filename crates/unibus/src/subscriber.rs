//! Subscription handles and the per-server subscriber registry.
//!
//! ## Lifecycle
//!
//! ```text
//!   subscribe() ──▶ Created (receive loop running)
//!                      │ unsubscribe()
//!                      ▼
//!                   Closed  (loop stopped, backend torn down, terminal)
//! ```
//!
//! `unsubscribe` is idempotent. The receive loop is told to stop through a
//! `watch` channel and awaited, so a partial batch is flushed before the
//! backend-side teardown runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{BrokerError, SubscribeOptions};

/// Backend-side cleanup run once when a subscription closes.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self) -> Result<(), BrokerError>;
}

/// Handle for one active subscription. Clones share state.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    id: Uuid,
    topic: String,
    queue_name: Option<String>,
    options: SubscribeOptions,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    teardown: Option<Box<dyn Teardown>>,
    registry: RwLock<Option<Weak<SubscriberRegistry>>>,
}

impl Subscriber {
    /// New handle plus the shutdown signal its receive loop listens on.
    pub fn new(
        topic: impl Into<String>,
        queue_name: Option<String>,
        options: SubscribeOptions,
        teardown: Option<Box<dyn Teardown>>,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown, signal) = watch::channel(false);
        let subscriber = Self {
            inner: Arc::new(SubscriberInner {
                id: Uuid::new_v4(),
                topic: topic.into(),
                queue_name,
                options,
                closed: AtomicBool::new(false),
                shutdown,
                task: Mutex::new(None),
                teardown,
                registry: RwLock::new(None),
            }),
        };
        (subscriber, signal)
    }

    /// Attach the spawned receive loop so `unsubscribe` can await it.
    pub fn set_task(&self, task: JoinHandle<()>) {
        *self.inner.task.lock() = Some(task);
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    #[must_use]
    pub fn queue_name(&self) -> Option<&str> {
        self.inner.queue_name.as_deref()
    }

    #[must_use]
    pub fn options(&self) -> &SubscribeOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same subscription.
    #[must_use]
    pub fn same_as(&self, other: &Subscriber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn attach(&self, registry: &Arc<SubscriberRegistry>) {
        *self.inner.registry.write() = Some(Arc::downgrade(registry));
    }

    /// Stop the receive loop and release backend resources.
    ///
    /// With `remove_from_registry`, the attached registry entry is dropped if
    /// it still points at this handle. Must not be awaited from inside this
    /// subscription's own handler.
    pub async fn unsubscribe(&self, remove_from_registry: bool) -> Result<(), BrokerError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.inner.shutdown.send(true);

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(topic = %self.inner.topic, error = %err, "Receive loop ended abnormally");
            }
        }

        let result = match &self.inner.teardown {
            Some(teardown) => teardown.teardown().await,
            None => Ok(()),
        };

        if remove_from_registry {
            let registry = self.inner.registry.read().as_ref().and_then(Weak::upgrade);
            if let Some(registry) = registry {
                registry.remove_if_same(self);
            }
        }

        debug!(topic = %self.inner.topic, id = %self.inner.id, "Unsubscribed");
        result
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("queue_name", &self.inner.queue_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Active subscriptions by topic; at most one per topic.
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: RwLock<HashMap<String, Subscriber>>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `subscriber`, returning the handle it replaced.
    pub fn insert(self: &Arc<Self>, subscriber: Subscriber) -> Option<Subscriber> {
        subscriber.attach(self);
        let replaced = self
            .entries
            .write()
            .insert(subscriber.topic().to_string(), subscriber);
        if let Some(old) = &replaced {
            debug!(topic = %old.topic(), "Subscriber replaced");
        }
        replaced
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<Subscriber> {
        self.entries.read().get(topic).cloned()
    }

    pub fn remove(&self, topic: &str) -> Option<Subscriber> {
        self.entries.write().remove(topic)
    }

    fn remove_if_same(&self, subscriber: &Subscriber) -> bool {
        let mut entries = self.entries.write();
        match entries.get(subscriber.topic()) {
            Some(current) if current.same_as(subscriber) => {
                entries.remove(subscriber.topic());
                true
            }
            _ => false,
        }
    }

    /// Snapshot for lifecycle iteration.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Subscriber> {
        self.entries.read().clone()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Subscriber> {
        self.entries.write().drain().map(|(_, s)| s).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
