//! Prometheus metrics for broker traffic.
//!
//! All metrics follow the naming convention: `unibus_<subject>_<unit>`.
//! Every series is labelled with the adapter's `system` (`memory`, `kafka`,
//! `rabbitmq`, `mqtt`); traffic counters also carry the `topic`.
//!
//! Recording never requires [`register_metrics`]: the collectors exist from
//! first use, registration only exposes them through [`encode_metrics`].

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Messages accepted by the backend
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("unibus_messages_published_total", "Messages accepted by the backend"),
        &["system", "topic"]
    ).expect("metric creation failed");

    /// Publishes that failed after any producer recovery
    pub static ref PUBLISH_FAILURES: CounterVec = CounterVec::new(
        Opts::new("unibus_publish_failures_total", "Publishes that returned an error"),
        &["system", "topic"]
    ).expect("metric creation failed");

    /// Cached producers replaced after a send failure
    pub static ref PRODUCER_RECOVERIES: CounterVec = CounterVec::new(
        Opts::new("unibus_producer_recoveries_total", "Cached producers recreated after a failed send"),
        &["system", "topic"]
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUME
    // =========================================================================

    /// Messages handed to a handler
    pub static ref MESSAGES_CONSUMED: CounterVec = CounterVec::new(
        Opts::new("unibus_messages_consumed_total", "Messages delivered to handlers"),
        &["system", "topic"]
    ).expect("metric creation failed");

    /// Handler invocations that returned an error
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("unibus_handler_failures_total", "Handler invocations that failed"),
        &["system", "topic"]
    ).expect("metric creation failed");

    /// Handler latency, single messages and batches alike
    pub static ref HANDLER_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "unibus_handler_duration_seconds",
            "Time spent inside handlers per invocation"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("valid bucket layout")),
        &["system"]
    ).expect("metric creation failed");

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Reconnect attempts made by adapter-owned retry loops
    pub static ref RECONNECT_ATTEMPTS: CounterVec = CounterVec::new(
        Opts::new("unibus_reconnect_attempts_total", "Reconnect attempts after a lost session"),
        &["system"]
    ).expect("metric creation failed");
}

pub fn record_published(system: &str, topic: &str) {
    MESSAGES_PUBLISHED.with_label_values(&[system, topic]).inc();
}

pub fn record_publish_failure(system: &str, topic: &str) {
    PUBLISH_FAILURES.with_label_values(&[system, topic]).inc();
}

pub fn record_producer_recovery(system: &str, topic: &str) {
    PRODUCER_RECOVERIES.with_label_values(&[system, topic]).inc();
}

pub fn record_consumed(system: &str, topic: &str) {
    MESSAGES_CONSUMED.with_label_values(&[system, topic]).inc();
}

pub fn record_handler_failure(system: &str, topic: &str) {
    HANDLER_FAILURES.with_label_values(&[system, topic]).inc();
}

pub fn record_reconnect_attempt(system: &str) {
    RECONNECT_ATTEMPTS.with_label_values(&[system]).inc();
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(PRODUCER_RECOVERIES.clone()),
        Box::new(MESSAGES_CONSUMED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(HANDLER_DURATION.clone()),
        Box::new(RECONNECT_ATTEMPTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Observes handler latency for `system` when dropped.
pub struct HandlerTimer {
    system: &'static str,
    start: Instant,
}

impl HandlerTimer {
    #[must_use]
    pub fn start(system: &'static str) -> Self {
        Self {
            system,
            start: Instant::now(),
        }
    }
}

impl Drop for HandlerTimer {
    fn drop(&mut self) {
        HANDLER_DURATION
            .with_label_values(&[self.system])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
