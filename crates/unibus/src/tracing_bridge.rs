//! Producer/consumer span correlation across the publish/subscribe boundary.
//!
//! ## Flow
//!
//! ```text
//!  publish:  parent cx ─▶ start "<system>.produce" ─▶ inject traceparent ─▶ headers
//!                                       └─ send outcome ─▶ message id, partition, status ─▶ end
//!
//!  receive:  headers ─▶ extract parent ─▶ start "<system>.consume" ─▶ handler runs in cx
//!                                       └─ handler outcome ─▶ status ─▶ end
//! ```
//!
//! Without a configured tracer every `start_*` call returns `None` and every
//! `finish_*` call accepts `None`, so call sites never branch on tracing.

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use unibus_telemetry::{HeaderExtractor, HeaderInjector};

use crate::domain::{BrokerError, Headers, SendReceipt, TracerOptions};

pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION: &str = "messaging.destination.name";
pub const MESSAGING_OPERATION: &str = "messaging.operation";
pub const MESSAGING_MESSAGE_ID: &str = "messaging.message.id";
pub const MESSAGING_PARTITION: &str = "messaging.destination.partition.id";

/// A started span, carried as the context that holds it.
#[derive(Debug, Clone)]
pub struct MessageSpan {
    cx: Context,
}

impl MessageSpan {
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.cx
    }
}

/// Span and header-propagation helper for one messaging system.
pub struct TracingBridge {
    system: &'static str,
    tracer: Option<BoxedTracer>,
    propagator: TraceContextPropagator,
}

impl TracingBridge {
    /// Enabled when `options` names a tracer from the global provider.
    pub fn new(system: &'static str, options: Option<&TracerOptions>) -> Self {
        Self {
            system,
            tracer: options.map(|o| global::tracer(o.tracer_name.clone())),
            propagator: TraceContextPropagator::new(),
        }
    }

    pub fn disabled(system: &'static str) -> Self {
        Self::new(system, None)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tracer.is_some()
    }

    #[must_use]
    pub fn system(&self) -> &'static str {
        self.system
    }

    /// Start a producer span and inject its context into `headers`.
    pub fn start_producer_span(
        &self,
        topic: &str,
        headers: &mut Headers,
        parent: Option<&Context>,
    ) -> Option<MessageSpan> {
        let tracer = self.tracer.as_ref()?;
        let parent_cx = parent.cloned().unwrap_or_else(Context::current);

        let span = tracer
            .span_builder(format!("{}.produce", self.system))
            .with_kind(SpanKind::Producer)
            .with_attributes(vec![
                KeyValue::new(MESSAGING_SYSTEM, self.system),
                KeyValue::new(MESSAGING_DESTINATION, topic.to_string()),
                KeyValue::new(MESSAGING_OPERATION, "publish"),
            ])
            .start_with_context(tracer, &parent_cx);

        let cx = parent_cx.with_span(span);
        self.propagator
            .inject_context(&cx, &mut HeaderInjector(headers));
        Some(MessageSpan { cx })
    }

    /// Attach the send outcome and end the span.
    pub fn finish_producer_span(
        &self,
        span: Option<MessageSpan>,
        outcome: Result<&SendReceipt, &BrokerError>,
    ) {
        let Some(span) = span else {
            return;
        };
        let active = span.cx.span();
        match outcome {
            Ok(receipt) => {
                active.set_attribute(KeyValue::new(
                    MESSAGING_MESSAGE_ID,
                    receipt.message_id.clone(),
                ));
                if let Some(partition) = receipt.partition {
                    active.set_attribute(KeyValue::new(MESSAGING_PARTITION, i64::from(partition)));
                }
                active.set_status(Status::Ok);
            }
            Err(err) => active.set_status(Status::error(err.to_string())),
        }
        active.end();
    }

    /// Context carried by `headers`, or an empty context.
    #[must_use]
    pub fn extract(&self, headers: &Headers) -> Context {
        self.propagator.extract(&HeaderExtractor(headers))
    }

    /// Start a consumer span as a child of the context in `headers`.
    pub fn start_consumer_span(
        &self,
        topic: &str,
        headers: &Headers,
        message_id: Option<&str>,
        partition: Option<i32>,
    ) -> Option<MessageSpan> {
        let tracer = self.tracer.as_ref()?;
        let parent_cx = self.extract(headers);

        let mut attributes = vec![
            KeyValue::new(MESSAGING_SYSTEM, self.system),
            KeyValue::new(MESSAGING_DESTINATION, topic.to_string()),
            KeyValue::new(MESSAGING_OPERATION, "receive"),
        ];
        if let Some(id) = message_id {
            attributes.push(KeyValue::new(MESSAGING_MESSAGE_ID, id.to_string()));
        }
        if let Some(partition) = partition {
            attributes.push(KeyValue::new(MESSAGING_PARTITION, i64::from(partition)));
        }

        let span = tracer
            .span_builder(format!("{}.consume", self.system))
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes)
            .start_with_context(tracer, &parent_cx);

        Some(MessageSpan {
            cx: parent_cx.with_span(span),
        })
    }

    /// Record the handler outcome and end the span.
    pub fn finish_consumer_span(&self, span: Option<MessageSpan>, error: Option<&BrokerError>) {
        let Some(span) = span else {
            return;
        };
        let active = span.cx.span();
        match error {
            Some(err) => active.set_status(Status::error(err.to_string())),
            None => active.set_status(Status::Ok),
        }
        active.end();
    }
}
