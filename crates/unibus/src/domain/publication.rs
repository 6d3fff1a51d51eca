//! One inbound delivery as handed to a handler.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry::Context;

use super::errors::BrokerError;
use super::message::{Body, Delivery, Headers, Message};

/// Commits one delivery at its backend coordinates.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Inbound delivery: topic, decoded message, native record and ack capability.
pub struct Publication {
    topic: String,
    message: Message,
    delivery: Delivery,
    raw: Box<dyn Any + Send + Sync>,
    acker: Option<Arc<dyn Acknowledger>>,
    acked: AtomicBool,
    error: Option<BrokerError>,
    trace_context: Context,
}

impl Publication {
    pub fn new(topic: impl Into<String>, message: Message, delivery: Delivery) -> Self {
        Self {
            topic: topic.into(),
            message,
            delivery,
            raw: Box::new(()),
            acker: None,
            acked: AtomicBool::new(false),
            error: None,
            trace_context: Context::new(),
        }
    }

    #[must_use]
    pub fn with_raw<R: Any + Send + Sync>(mut self, raw: R) -> Self {
        self.raw = Box::new(raw);
        self
    }

    #[must_use]
    pub fn with_raw_boxed(mut self, raw: Box<dyn Any + Send + Sync>) -> Self {
        self.raw = raw;
        self
    }

    #[must_use]
    pub fn with_acknowledger(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<BrokerError>) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub fn with_trace_context(mut self, cx: Context) -> Self {
        self.trace_context = cx;
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.message.body
    }

    #[must_use]
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Backend-native record, e.g. `raw().downcast_ref::<LogRecord>()`.
    #[must_use]
    pub fn raw(&self) -> &(dyn Any + Send + Sync) {
        self.raw.as_ref()
    }

    /// Decode failure recorded for this delivery, if any.
    #[must_use]
    pub fn error(&self) -> Option<&BrokerError> {
        self.error.as_ref()
    }

    /// Context extracted from the inbound headers (child consumer span when tracing).
    #[must_use]
    pub fn trace_context(&self) -> &Context {
        &self.trace_context
    }

    /// Commit this delivery. Succeeds once; later calls fail.
    pub fn ack(&self) -> Result<(), BrokerError> {
        if self.acked.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::Protocol("already acknowledged".into()));
        }
        let Some(acker) = &self.acker else {
            return Ok(());
        };
        if let Err(err) = acker.ack(&self.delivery) {
            self.acked.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.topic)
            .field("delivery", &self.delivery)
            .field("body", &self.message.body)
            .field("acked", &self.is_acked())
            .field("error", &self.error)
            .finish()
    }
}
