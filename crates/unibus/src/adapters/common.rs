//! Pieces every adapter shares: option/state bookkeeping and the delivery path.
//!
//! ```text
//!  native record ─▶ Incoming ─▶ consumer span ─▶ decode ─▶ Publication
//!                                                              │
//!                       settle (auto-ack policy) ◀── handler ◀─┘
//! ```

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use opentelemetry::trace::FutureExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, error, warn};
use unibus_telemetry::metrics;

use crate::domain::errors::collect_teardown;
use crate::domain::{
    Acknowledger, Binder, Body, BrokerError, BrokerOptions, ConnectionState, Delivery,
    HandlerErrorPolicy, Headers, Message, Payload, Publication, StateCell, SubscribeOptions,
};
use crate::ports::Handler;
use crate::subscriber::Subscriber;
use crate::tracing_bridge::TracingBridge;

/// Pause after a failed native receive before polling again.
pub(crate) const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Options, connection state, tracing bridge and live subscriptions.
pub(crate) struct AdapterCore {
    system: &'static str,
    options: RwLock<BrokerOptions>,
    state: StateCell,
    bridge: RwLock<Arc<TracingBridge>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl AdapterCore {
    pub(crate) fn new(system: &'static str, options: BrokerOptions) -> Self {
        let bridge = Arc::new(TracingBridge::new(system, options.tracer()));
        Self {
            system,
            options: RwLock::new(options),
            state: StateCell::new(system),
            bridge: RwLock::new(bridge),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn system(&self) -> &'static str {
        self.system
    }

    /// Replace the options; rejected unless disconnected.
    pub(crate) fn init(&self, options: BrokerOptions) -> Result<(), BrokerError> {
        if self.state.get() != ConnectionState::Disconnected {
            return Err(BrokerError::Configuration(
                "cannot init while connected".into(),
            ));
        }
        options.validate()?;
        *self.bridge.write() = Arc::new(TracingBridge::new(self.system, options.tracer()));
        *self.options.write() = options;
        debug!(system = self.system, "Broker options applied");
        Ok(())
    }

    pub(crate) fn options(&self) -> BrokerOptions {
        self.options.read().clone()
    }

    pub(crate) fn state(&self) -> &StateCell {
        &self.state
    }

    pub(crate) fn bridge(&self) -> Arc<TracingBridge> {
        Arc::clone(&self.bridge.read())
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    /// Encode with the configured codec.
    pub(crate) fn encode(&self, payload: Payload) -> Result<Bytes, BrokerError> {
        let options = self.options.read();
        options.codecs().encode(options.codec(), payload)
    }

    /// Build the delivery path for a new subscription.
    pub(crate) fn dispatcher(
        &self,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Dispatcher {
        let broker_options = self.options.read();
        Dispatcher {
            system: self.system,
            codec: broker_options.codec().to_string(),
            codecs: broker_options.codecs().clone(),
            binder,
            handler,
            bridge: self.bridge(),
            options,
        }
    }

    pub(crate) fn track(&self, subscriber: &Subscriber) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| !s.is_closed());
        subscribers.push(subscriber.clone());
    }

    /// Close every live subscription, returning the failures.
    pub(crate) async fn close_subscribers(&self) -> Vec<BrokerError> {
        let subscribers: Vec<_> = self.subscribers.write().drain(..).collect();
        let mut errors = Vec::new();
        for subscriber in subscribers {
            if let Err(err) = subscriber.unsubscribe(true).await {
                warn!(
                    system = self.system,
                    topic = %subscriber.topic(),
                    error = %err,
                    "Subscriber teardown failed"
                );
                errors.push(err);
            }
        }
        errors
    }

    /// Shared disconnect tail: close subscriptions, run `close`, fold errors.
    pub(crate) async fn shutdown<Fut>(&self, close: Fut) -> Result<(), BrokerError>
    where
        Fut: Future<Output = Vec<BrokerError>>,
    {
        let mut errors = self.close_subscribers().await;
        errors.extend(close.await);
        self.state.set(ConnectionState::Disconnected);
        collect_teardown(errors)
    }
}

/// One native delivery before decoding.
pub(crate) struct Incoming {
    pub topic: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub delivery: Delivery,
    pub message_id: Option<String>,
    pub partition: Option<i32>,
    pub raw: Box<dyn Any + Send + Sync>,
    pub acker: Option<Arc<dyn Acknowledger>>,
}

/// Decode, trace, invoke and settle deliveries for one subscription.
pub(crate) struct Dispatcher {
    system: &'static str,
    codec: String,
    codecs: crate::domain::CodecRegistry,
    binder: Option<Binder>,
    handler: Arc<dyn Handler>,
    bridge: Arc<TracingBridge>,
    options: SubscribeOptions,
}

impl Dispatcher {
    pub(crate) fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn publication(&self, incoming: Incoming, cx: opentelemetry::Context) -> Publication {
        let (body, error) = match self
            .codecs
            .decode(&self.codec, &incoming.payload, self.binder.as_ref())
        {
            Ok(body) => (body, None),
            Err(err) => {
                warn!(
                    system = self.system,
                    topic = %incoming.topic,
                    error = %err,
                    "Payload decode failed, delivering raw bytes"
                );
                (Body::Raw(incoming.payload.clone()), Some(err))
            }
        };

        let mut publication = Publication::new(
            incoming.topic,
            Message {
                headers: incoming.headers,
                body,
            },
            incoming.delivery,
        )
        .with_error(error)
        .with_trace_context(cx);
        publication = match incoming.acker {
            Some(acker) => publication.with_acknowledger(acker),
            None => publication,
        };
        publication.with_raw_boxed(incoming.raw)
    }

    /// One message, one handler invocation.
    pub(crate) async fn deliver(&self, incoming: Incoming) -> Result<(), BrokerError> {
        let span = self.bridge.start_consumer_span(
            &incoming.topic,
            &incoming.headers,
            incoming.message_id.as_deref(),
            incoming.partition,
        );
        let cx = match &span {
            Some(span) => span.context().clone(),
            None => self.bridge.extract(&incoming.headers),
        };

        let publication = self.publication(incoming, cx.clone());
        metrics::record_consumed(self.system, publication.topic());
        let timer = metrics::HandlerTimer::start(self.system);
        let result = self.handler.handle(&publication).with_context(cx).await;
        drop(timer);

        if let Err(err) = &result {
            error!(
                system = self.system,
                topic = %publication.topic(),
                error = %err,
                "Handler failed"
            );
            metrics::record_handler_failure(self.system, publication.topic());
        }
        self.bridge.finish_consumer_span(span, result.as_ref().err());
        self.settle(&publication, &result);
        result
    }

    /// Ordered batch, one handler invocation.
    pub(crate) async fn deliver_batch(&self, batch: Vec<Incoming>) -> Result<(), BrokerError> {
        let mut spans = Vec::with_capacity(batch.len());
        let mut publications = Vec::with_capacity(batch.len());
        for incoming in batch {
            let span = self.bridge.start_consumer_span(
                &incoming.topic,
                &incoming.headers,
                incoming.message_id.as_deref(),
                incoming.partition,
            );
            let cx = match &span {
                Some(span) => span.context().clone(),
                None => self.bridge.extract(&incoming.headers),
            };
            spans.push(span);
            publications.push(self.publication(incoming, cx));
        }

        let topic = publications
            .first()
            .map(|p| p.topic().to_string())
            .unwrap_or_default();
        debug!(system = self.system, topic = %topic, size = publications.len(), "Delivering batch");
        for publication in &publications {
            metrics::record_consumed(self.system, publication.topic());
        }

        let timer = metrics::HandlerTimer::start(self.system);
        let result = self.handler.handle_batch(&publications).await;
        drop(timer);
        if let Err(err) = &result {
            error!(system = self.system, topic = %topic, error = %err, "Batch handler failed");
            metrics::record_handler_failure(self.system, &topic);
        }
        for span in spans {
            self.bridge.finish_consumer_span(span, result.as_ref().err());
        }
        for publication in &publications {
            self.settle(publication, &result);
        }
        result
    }

    fn settle(&self, publication: &Publication, result: &Result<(), BrokerError>) {
        if !self.options.auto_ack() || publication.is_acked() {
            return;
        }
        if result.is_err() && self.options.on_handler_error() == HandlerErrorPolicy::Retain {
            debug!(
                system = self.system,
                topic = %publication.topic(),
                "Retaining failed delivery uncommitted"
            );
            return;
        }
        if let Err(err) = publication.ack() {
            error!(
                system = self.system,
                topic = %publication.topic(),
                error = %err,
                "Unable to commit message"
            );
        }
    }
}

/// Sleep until `deadline`, or forever without one.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Back off after a receive failure; false when shutdown fired meanwhile.
pub(crate) async fn backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = sleep(RECEIVE_RETRY_DELAY) => true,
    }
}
