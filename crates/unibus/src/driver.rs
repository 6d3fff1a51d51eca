//! Backend selection.
//!
//! The adapter is chosen once, at construction, from a [`Backend`]; there is
//! no switching after `init`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::adapters::{LogBroker, MemoryBroker, MqttBroker, QueueBroker};
use crate::domain::{BrokerError, BrokerOptions};
use crate::ports::{Broker, LogCluster, QueueConnection, SessionClient};

/// Supported adapter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverType {
    Memory,
    Log,
    Queue,
    Mqtt,
}

impl DriverType {
    /// Canonical driver name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Log => "log",
            Self::Queue => "queue",
            Self::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "log" | "kafka" => Ok(Self::Log),
            "queue" | "amqp" | "rabbitmq" => Ok(Self::Queue),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(BrokerError::Configuration(format!(
                "unknown broker driver: {other}"
            ))),
        }
    }
}

/// Native client for the chosen driver.
#[derive(Clone)]
pub enum Backend {
    Memory,
    Log(Arc<dyn LogCluster>),
    Queue(Arc<dyn QueueConnection>),
    Mqtt(Arc<dyn SessionClient>),
}

impl Backend {
    #[must_use]
    pub fn driver_type(&self) -> DriverType {
        match self {
            Self::Memory => DriverType::Memory,
            Self::Log(_) => DriverType::Log,
            Self::Queue(_) => DriverType::Queue,
            Self::Mqtt(_) => DriverType::Mqtt,
        }
    }

    /// In-process backend for `driver`.
    #[must_use]
    pub fn reference(driver: DriverType) -> Self {
        use crate::backends::{MemoryLogCluster, MemoryQueueBroker, MemorySessionBroker};
        match driver {
            DriverType::Memory => Self::Memory,
            DriverType::Log => Self::Log(Arc::new(MemoryLogCluster::new())),
            DriverType::Queue => Self::Queue(Arc::new(MemoryQueueBroker::new())),
            DriverType::Mqtt => Self::Mqtt(Arc::new(MemorySessionBroker::new().client())),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.driver_type()).finish()
    }
}

/// Build the adapter for `backend` after validating `options`.
pub fn new_broker(backend: Backend, options: BrokerOptions) -> Result<Arc<dyn Broker>, BrokerError> {
    options.validate()?;
    let driver = backend.driver_type();
    let broker: Arc<dyn Broker> = match backend {
        Backend::Memory => Arc::new(MemoryBroker::new(options)),
        Backend::Log(cluster) => Arc::new(LogBroker::new(cluster, options)),
        Backend::Queue(connection) => Arc::new(QueueBroker::new(connection, options)),
        Backend::Mqtt(client) => Arc::new(MqttBroker::new(client, options)),
    };
    info!(driver = %driver, system = broker.name(), "Broker created");
    Ok(broker)
}
