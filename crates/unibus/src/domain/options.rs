//! Broker, subscribe and publish options.
//!
//! Every option set is produced by a validating builder and is immutable
//! afterwards. Backend-specific settings live in one typed section per
//! adapter instead of loosely typed lookups.
//!
//! ## Environment Variables (`BrokerOptionsBuilder::from_env`)
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `UNIBUS_ADDRESS` | backend default | Comma separated broker addresses |
//! | `UNIBUS_CODEC` | `json` | Codec identifier, empty for raw-only |
//! | `UNIBUS_QUEUE_NAME` | unset | Default queue / consumer group |
//! | `UNIBUS_TRACER` | unset | Tracer name; enables span propagation |

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::Context;

use super::codec::{Codec, CodecRegistry};
use super::errors::BrokerError;
use super::message::{Headers, SendReceipt};

/// Default codec identifier.
pub const DEFAULT_CODEC: &str = "json";

/// Default batch interval.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound for one log fetch.
pub const DEFAULT_MAX_READ_BYTES: usize = 1024 * 1024;

/// Default wait before a log fetch returns what it has.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Default pause between session reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// TLS material locations. Carried to the native client untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Tracer selection. Presence enables the tracing bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerOptions {
    pub tracer_name: String,
}

impl TracerOptions {
    pub fn new(tracer_name: impl Into<String>) -> Self {
        Self {
            tracer_name: tracer_name.into(),
        }
    }
}

/// Callback receiving the outcome of an asynchronous log publish.
pub type CompletionFn = Arc<dyn Fn(&str, Result<SendReceipt, BrokerError>) + Send + Sync>;

/// Replica acknowledgement level requested from a log producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequiredAcks {
    None,
    Leader,
    #[default]
    All,
}

/// Partitioned log adapter settings.
#[derive(Clone, Default)]
pub struct LogOptions {
    /// Return from `publish` before the send completes.
    pub async_publish: bool,
    /// Receives each asynchronous outcome.
    pub completion: Option<CompletionFn>,
    pub required_acks: RequiredAcks,
}

impl fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOptions")
            .field("async_publish", &self.async_publish)
            .field("completion", &self.completion.is_some())
            .field("required_acks", &self.required_acks)
            .finish()
    }
}

/// Exchange/queue adapter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub exchange: String,
    pub durable: bool,
    /// Unacknowledged deliveries allowed in flight per consumer.
    pub prefetch: u16,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            exchange: "unibus".to_string(),
            durable: true,
            prefetch: 10,
        }
    }
}

/// Session delivery guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Session (MQTT-style) adapter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOptions {
    /// Generated per adapter when unset.
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub reconnect_interval: Duration,
    pub qos: QoS,
    pub retain: bool,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            clean_session: true,
            credentials: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// Broker-wide configuration, applied by `init`.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    addresses: Vec<String>,
    codec: String,
    codecs: CodecRegistry,
    tls: Option<TlsOptions>,
    tracer: Option<TracerOptions>,
    queue_name: Option<String>,
    log: LogOptions,
    queue: QueueOptions,
    mqtt: MqttOptions,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            codec: DEFAULT_CODEC.to_string(),
            codecs: CodecRegistry::with_defaults(),
            tls: None,
            tracer: None,
            queue_name: None,
            log: LogOptions::default(),
            queue: QueueOptions::default(),
            mqtt: MqttOptions::default(),
        }
    }
}

impl BrokerOptions {
    #[must_use]
    pub fn builder() -> BrokerOptionsBuilder {
        BrokerOptionsBuilder::default()
    }

    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    #[must_use]
    pub fn codec(&self) -> &str {
        &self.codec
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    #[must_use]
    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn tracer(&self) -> Option<&TracerOptions> {
        self.tracer.as_ref()
    }

    #[must_use]
    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    #[must_use]
    pub fn log(&self) -> &LogOptions {
        &self.log
    }

    #[must_use]
    pub fn queue(&self) -> &QueueOptions {
        &self.queue
    }

    #[must_use]
    pub fn mqtt(&self) -> &MqttOptions {
        &self.mqtt
    }

    /// Addresses joined for display, or `default` when none are set.
    #[must_use]
    pub fn address_or(&self, default: &str) -> String {
        if self.addresses.is_empty() {
            default.to_string()
        } else {
            self.addresses.join(",")
        }
    }

    /// Check the record; used by the builder and again by `init`.
    pub fn validate(&self) -> Result<(), BrokerError> {
        for address in &self.addresses {
            if address.trim().is_empty() || address.contains(char::is_whitespace) {
                return Err(BrokerError::Configuration(format!(
                    "invalid broker address '{address}'"
                )));
            }
        }
        if !self.codec.is_empty() && !self.codecs.contains(&self.codec) {
            return Err(BrokerError::Configuration(format!(
                "codec '{}' is not registered",
                self.codec
            )));
        }
        if self.mqtt.reconnect_interval.is_zero() {
            return Err(BrokerError::Configuration(
                "reconnect interval must be positive".into(),
            ));
        }
        if self.queue.prefetch == 0 {
            return Err(BrokerError::Configuration(
                "prefetch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BrokerOptions`].
#[derive(Debug, Default)]
pub struct BrokerOptionsBuilder {
    options: BrokerOptions,
}

impl BrokerOptionsBuilder {
    /// Start from the `UNIBUS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut builder = Self::default();
        if let Ok(addresses) = env::var("UNIBUS_ADDRESS") {
            builder = builder.addresses(
                addresses
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            );
        }
        if let Ok(codec) = env::var("UNIBUS_CODEC") {
            builder = builder.codec(codec.trim());
        }
        if let Ok(queue) = env::var("UNIBUS_QUEUE_NAME") {
            builder = builder.queue_name(queue);
        }
        if let Ok(tracer) = env::var("UNIBUS_TRACER") {
            builder = builder.tracer(TracerOptions::new(tracer));
        }
        builder
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.options.addresses.push(address.into());
        self
    }

    #[must_use]
    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Empty string selects raw-only mode.
    #[must_use]
    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.options.codec = codec.into();
        self
    }

    #[must_use]
    pub fn register_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.options.codecs.register(codec);
        self
    }

    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.options.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn tracer(mut self, tracer: TracerOptions) -> Self {
        self.options.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.options.queue_name = Some(queue_name.into());
        self
    }

    #[must_use]
    pub fn log(mut self, log: LogOptions) -> Self {
        self.options.log = log;
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: QueueOptions) -> Self {
        self.options.queue = queue;
        self
    }

    #[must_use]
    pub fn mqtt(mut self, mqtt: MqttOptions) -> Self {
        self.options.mqtt = mqtt;
        self
    }

    pub fn build(self) -> Result<BrokerOptions, BrokerError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// What auto-ack does with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Commit regardless of the handler outcome (at-most-once on failure).
    #[default]
    Commit,
    /// Leave failed deliveries uncommitted.
    Retain,
}

/// Per-subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    queue_name: Option<String>,
    auto_ack: bool,
    on_handler_error: HandlerErrorPolicy,
    batch_size: usize,
    batch_interval: Duration,
    min_read_bytes: usize,
    max_read_bytes: usize,
    max_wait: Duration,
    read_lag_interval: Option<Duration>,
    durable_queue: bool,
    exclusive_queue: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            auto_ack: true,
            on_handler_error: HandlerErrorPolicy::Commit,
            batch_size: 1,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            min_read_bytes: 1,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            max_wait: DEFAULT_MAX_WAIT,
            read_lag_interval: None,
            durable_queue: false,
            exclusive_queue: false,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn builder() -> SubscribeOptionsBuilder {
        SubscribeOptionsBuilder::default()
    }

    /// Defaults joined to the consumer group / queue `name`.
    #[must_use]
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    #[must_use]
    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    #[must_use]
    pub fn on_handler_error(&self) -> HandlerErrorPolicy {
        self.on_handler_error
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn batch_interval(&self) -> Duration {
        self.batch_interval
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        self.batch_size > 1
    }

    #[must_use]
    pub fn min_read_bytes(&self) -> usize {
        self.min_read_bytes
    }

    #[must_use]
    pub fn max_read_bytes(&self) -> usize {
        self.max_read_bytes
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// `None` disables lag tracking.
    #[must_use]
    pub fn read_lag_interval(&self) -> Option<Duration> {
        self.read_lag_interval
    }

    #[must_use]
    pub fn durable_queue(&self) -> bool {
        self.durable_queue
    }

    #[must_use]
    pub fn exclusive_queue(&self) -> bool {
        self.exclusive_queue
    }
}

/// Builder for [`SubscribeOptions`].
#[derive(Debug, Default)]
pub struct SubscribeOptionsBuilder {
    options: SubscribeOptions,
}

impl SubscribeOptionsBuilder {
    #[must_use]
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.options.queue_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.options.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn on_handler_error(mut self, policy: HandlerErrorPolicy) -> Self {
        self.options.on_handler_error = policy;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.options.batch_size = size;
        self
    }

    #[must_use]
    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.options.batch_interval = interval;
        self
    }

    #[must_use]
    pub fn min_read_bytes(mut self, bytes: usize) -> Self {
        self.options.min_read_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_read_bytes(mut self, bytes: usize) -> Self {
        self.options.max_read_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.options.max_wait = wait;
        self
    }

    #[must_use]
    pub fn read_lag_interval(mut self, interval: Option<Duration>) -> Self {
        self.options.read_lag_interval = interval;
        self
    }

    /// Millisecond form; a negative value disables lag tracking.
    #[must_use]
    pub fn read_lag_interval_ms(mut self, millis: i64) -> Self {
        self.options.read_lag_interval = u64::try_from(millis).ok().map(Duration::from_millis);
        self
    }

    #[must_use]
    pub fn durable_queue(mut self, durable: bool) -> Self {
        self.options.durable_queue = durable;
        self
    }

    #[must_use]
    pub fn exclusive_queue(mut self, exclusive: bool) -> Self {
        self.options.exclusive_queue = exclusive;
        self
    }

    pub fn build(self) -> Result<SubscribeOptions, BrokerError> {
        let o = &self.options;
        if o.batch_size == 0 {
            return Err(BrokerError::Configuration(
                "batch size must be at least 1".into(),
            ));
        }
        if o.batch_interval.is_zero() {
            return Err(BrokerError::Configuration(
                "batch interval must be positive".into(),
            ));
        }
        if o.min_read_bytes > o.max_read_bytes {
            return Err(BrokerError::Configuration(format!(
                "min read bytes ({}) exceeds max read bytes ({})",
                o.min_read_bytes, o.max_read_bytes
            )));
        }
        if o.queue_name.as_deref().is_some_and(str::is_empty) {
            return Err(BrokerError::Configuration(
                "queue name must not be empty".into(),
            ));
        }
        Ok(self.options)
    }
}

/// Per-publish settings.
#[derive(Clone, Default)]
pub struct PublishOptions {
    pub headers: Headers,
    /// Partition key for log backends.
    pub key: Option<Bytes>,
    /// Parent for the producer span; `Context::current()` when unset.
    pub trace_context: Option<Context>,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn trace_context(mut self, cx: Context) -> Self {
        self.trace_context = Some(cx);
        self
    }
}

impl fmt::Debug for PublishOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishOptions")
            .field("headers", &self.headers)
            .field("key", &self.key)
            .field("trace_context", &self.trace_context.is_some())
            .finish()
    }
}
