//! # Trace Propagation
//!
//! A consumer continues the producer's trace through the `traceparent`
//! header, whichever backend carried the message.

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry::Context;
    use tokio::sync::mpsc;
    use unibus::domain::TracerOptions;
    use unibus::{
        handler_fn, new_broker, Backend, BrokerOptions, Payload, PublishOptions, SubscribeOptions,
    };

    use crate::integration::fixtures::{group, recv, ALL_DRIVERS};

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    fn upstream() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex(TRACE_ID).expect("valid trace id"),
            SpanId::from_hex(SPAN_ID).expect("valid span id"),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    fn traced() -> BrokerOptions {
        BrokerOptions::builder()
            .tracer(TracerOptions::new("unibus-tests"))
            .mqtt(unibus::domain::MqttOptions {
                reconnect_interval: std::time::Duration::from_millis(10),
                ..Default::default()
            })
            .build()
            .expect("valid options")
    }

    #[derive(Debug)]
    struct Seen {
        traceparent: Option<String>,
        tenant: Option<String>,
        trace_id: TraceId,
    }

    fn observer(tx: mpsc::UnboundedSender<Seen>) -> std::sync::Arc<dyn unibus::Handler> {
        handler_fn(move |p| {
            let _ = tx.send(Seen {
                traceparent: p.headers().get("traceparent").cloned(),
                tenant: p.headers().get("tenant").cloned(),
                trace_id: p.trace_context().span().span_context().trace_id(),
            });
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_consumer_continues_producer_trace() -> anyhow::Result<()> {
        for driver in ALL_DRIVERS {
            let broker = new_broker(Backend::reference(driver), traced())?;
            broker.connect().await?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            let _sub = broker
                .subscribe("orders.created", observer(tx), None, group("fulfilment", true))
                .await?;

            broker
                .publish(
                    "orders.created",
                    Payload::from("o-77"),
                    PublishOptions::new()
                        .header("tenant", "acme")
                        .trace_context(upstream()),
                )
                .await?;

            let seen = recv(&mut rx).await;
            let traceparent = seen.traceparent.expect("traceparent header");
            assert!(traceparent.contains(TRACE_ID), "{driver}: {traceparent}");
            assert_eq!(seen.tenant.as_deref(), Some("acme"), "{driver}");
            assert_eq!(seen.trace_id.to_string(), TRACE_ID, "{driver}");

            broker.disconnect().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_untraced_broker_adds_no_headers() -> anyhow::Result<()> {
        let broker = new_broker(Backend::Memory, BrokerOptions::default())?;
        broker.connect().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe("orders.created", observer(tx), None, SubscribeOptions::default())
            .await?;

        broker
            .publish(
                "orders.created",
                Payload::from("o-78"),
                PublishOptions::new().header("tenant", "acme"),
            )
            .await?;

        let seen = recv(&mut rx).await;
        assert_eq!(seen.traceparent, None);
        assert_eq!(seen.tenant.as_deref(), Some("acme"));
        assert_eq!(seen.trace_id, TraceId::INVALID);
        Ok(())
    }
}
