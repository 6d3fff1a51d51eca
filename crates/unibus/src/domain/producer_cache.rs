//! Per-topic producer reuse with single-retry recovery.
//!
//! ## Recovery policy
//!
//! ```text
//!   cache hit ── send ok ──────────────────────────────▶ Ok
//!       │
//!       └─ send err ─▶ evict + shutdown stale ─▶ create ─▶ retry once
//!                                                  ├─ ok  ─▶ install, Ok
//!                                                  └─ err ─▶ shutdown, Err
//!
//!   cache miss ─ create ─ send ok ─▶ install, Ok
//!                   └──── send err ─▶ shutdown, Err (no retry)
//! ```
//!
//! Eviction compares producer identity, so a publisher that lost a race
//! reuses the replacement another publisher already installed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::errors::BrokerError;

/// Creates and tears down producers for one backend.
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    type Producer: ?Sized + Send + Sync;

    async fn create(&self, topic: &str) -> Result<Arc<Self::Producer>, BrokerError>;

    async fn shutdown(&self, producer: Arc<Self::Producer>) -> Result<(), BrokerError>;
}

/// At most one live producer per topic.
pub struct ProducerCache<F: ProducerFactory> {
    factory: F,
    entries: RwLock<HashMap<String, Arc<F::Producer>>>,
    created: AtomicUsize,
    recoveries: AtomicUsize,
}

impl<F: ProducerFactory> ProducerCache<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            entries: RwLock::new(HashMap::new()),
            created: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
        }
    }

    /// Run `send` against the topic's producer, applying the recovery policy.
    pub async fn send_with<T, S, Fut>(&self, topic: &str, send: S) -> Result<T, BrokerError>
    where
        S: Fn(Arc<F::Producer>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BrokerError>> + Send,
        T: Send,
    {
        let cached = self.entries.read().await.get(topic).cloned();

        match cached {
            Some(producer) => match send(Arc::clone(&producer)).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    warn!(topic, error = %err, "Send failed on cached producer, recreating");
                    self.recover(topic, producer, &send).await
                }
            },
            None => {
                let producer = self.create(topic).await?;
                match send(Arc::clone(&producer)).await {
                    Ok(value) => {
                        self.install(topic, producer).await;
                        Ok(value)
                    }
                    Err(err) => {
                        self.discard(topic, producer).await;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn recover<T, S, Fut>(
        &self,
        topic: &str,
        stale: Arc<F::Producer>,
        send: &S,
    ) -> Result<T, BrokerError>
    where
        S: Fn(Arc<F::Producer>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BrokerError>> + Send,
        T: Send,
    {
        self.recoveries.fetch_add(1, Ordering::Relaxed);

        let replaced_by_peer = {
            let mut entries = self.entries.write().await;
            match entries.get(topic) {
                Some(current) if !Arc::ptr_eq(current, &stale) => Some(Arc::clone(current)),
                Some(_) => {
                    entries.remove(topic);
                    None
                }
                None => None,
            }
        };

        if let Some(current) = replaced_by_peer {
            debug!(topic, "Producer already replaced, retrying on replacement");
            return send(current).await;
        }

        self.discard(topic, stale).await;

        let fresh = self.create(topic).await?;
        match send(Arc::clone(&fresh)).await {
            Ok(value) => {
                self.install(topic, fresh).await;
                Ok(value)
            }
            Err(err) => {
                warn!(topic, error = %err, "Retry on recreated producer failed");
                self.discard(topic, fresh).await;
                Err(err)
            }
        }
    }

    async fn create(&self, topic: &str) -> Result<Arc<F::Producer>, BrokerError> {
        let producer = self.factory.create(topic).await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(topic, "Producer created");
        Ok(producer)
    }

    async fn install(&self, topic: &str, producer: Arc<F::Producer>) {
        let displaced = {
            let mut entries = self.entries.write().await;
            if entries.contains_key(topic) {
                Some(producer)
            } else {
                entries.insert(topic.to_string(), producer);
                None
            }
        };
        // A concurrent publisher installed first; keep theirs.
        if let Some(extra) = displaced {
            self.discard(topic, extra).await;
        }
    }

    async fn discard(&self, topic: &str, producer: Arc<F::Producer>) {
        if let Err(err) = self.factory.shutdown(producer).await {
            warn!(topic, error = %err, "Producer shutdown failed");
        }
    }

    /// Shut every cached producer down, returning the failures.
    pub async fn close_all(&self) -> Vec<BrokerError> {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        let mut errors = Vec::new();
        for (topic, producer) in drained {
            if let Err(err) = self.factory.shutdown(producer).await {
                warn!(topic = %topic, error = %err, "Producer shutdown failed");
                errors.push(err);
            }
        }
        errors
    }

    /// Total producers created since construction.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Recover-and-retry cycles entered since construction.
    #[must_use]
    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, topic: &str) -> bool {
        self.entries.read().await.contains_key(topic)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}
