//! # Unibus Telemetry
//!
//! Ambient observability for the unibus broker layer.
//!
//! ## Components
//!
//! - **Logs**: `tracing-subscriber` output, human-readable or JSON lines
//! - **Traces**: OpenTelemetry spans exported over OTLP gRPC
//! - **Propagation**: W3C trace context carried in message headers
//! - **Metrics**: Prometheus counters per backend system and topic
//!
//! ## Usage
//!
//! ```rust,ignore
//! use unibus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).await?;
//!     // brokers created from here on log, trace and count
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `UNIBUS_SERVICE_NAME` / `OTEL_SERVICE_NAME` | `unibus` | Service name in traces |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` | OTLP collector |
//! | `UNIBUS_OTLP_ENABLED` | set when an endpoint is given | Export spans |
//! | `UNIBUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `UNIBUS_CONSOLE_OUTPUT` | `true` | Log to stdout |
//! | `UNIBUS_JSON_LOGS` | `true` in containers | JSON log lines |
//! | `UNIBUS_ENVIRONMENT` | `dev` | `deployment.environment` resource |

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod config;
mod context;
mod logging;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use context::{HeaderExtractor, HeaderInjector};
pub use logging::{env_filter, fmt_layer};
pub use metrics::{encode_metrics, register_metrics};
pub use tracing_setup::{init_tracing, TracingGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize metrics registration, propagation, span export and logging.
///
/// Returns a guard that must be held for the lifetime of the application.
/// Dropping it flushes pending spans. Fails with [`TelemetryError::TracerInit`]
/// if a global subscriber is already installed.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    let tracing = init_tracing(&config).await?;
    Ok(TelemetryGuard { tracing })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    tracing: TracingGuard,
}

impl TelemetryGuard {
    /// True when spans leave the process over OTLP.
    #[must_use]
    pub fn is_exporting(&self) -> bool {
        self.tracing.is_exporting()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_telemetry_without_export() {
        let config = TelemetryConfig {
            otlp_enabled: false,
            console_output: false,
            log_level: "warn".to_string(),
            ..TelemetryConfig::default()
        };
        // Another test binary may own the global subscriber.
        match init_telemetry(config).await {
            Ok(guard) => assert!(!guard.is_exporting()),
            Err(e) => assert!(matches!(e, TelemetryError::TracerInit(_))),
        }
    }

    #[test]
    fn test_error_display() {
        let err = TelemetryError::Config("bad".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad");
    }
}
