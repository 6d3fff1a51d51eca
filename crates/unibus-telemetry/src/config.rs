//! Telemetry configuration from environment variables.

use std::env;

const DEFAULT_SERVICE_NAME: &str = "unibus";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Process-level telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name in traces and logs
    pub service_name: String,

    /// OpenTelemetry OTLP gRPC endpoint
    pub otlp_endpoint: String,

    /// Export spans over OTLP; when false only local logging is installed
    pub otlp_enabled: bool,

    /// Log level filter (trace, debug, info, warn, error) or a full directive
    pub log_level: String,

    /// Whether to write logs to stdout
    pub console_output: bool,

    /// JSON formatted logs instead of the human-readable format
    pub json_logs: bool,

    /// Deployment environment (dev, staging, prod)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            otlp_enabled: false,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            environment: "dev".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `UNIBUS_SERVICE_NAME` or `OTEL_SERVICE_NAME`: Service name (default: unibus)
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
    /// - `UNIBUS_OTLP_ENABLED`: Export spans (default: true when an endpoint is set)
    /// - `UNIBUS_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `UNIBUS_CONSOLE_OUTPUT`: Log to stdout (default: true)
    /// - `UNIBUS_JSON_LOGS`: JSON logs (default: false outside containers)
    /// - `UNIBUS_ENVIRONMENT`: Deployment environment (default: dev)
    #[must_use]
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();
        let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        Self {
            service_name: env::var("UNIBUS_SERVICE_NAME")
                .or_else(|_| env::var("OTEL_SERVICE_NAME"))
                .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string()),

            otlp_enabled: flag(env::var("UNIBUS_OTLP_ENABLED").ok(), endpoint.is_some()),

            otlp_endpoint: endpoint.unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),

            log_level: env::var("UNIBUS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: flag(env::var("UNIBUS_CONSOLE_OUTPUT").ok(), true),

            json_logs: flag(env::var("UNIBUS_JSON_LOGS").ok(), is_container),

            environment: env::var("UNIBUS_ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
        }
    }

    /// Same configuration under another service name.
    #[must_use]
    pub fn for_service(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::from_env()
        }
    }
}

/// Parse a boolean switch; unrecognised values fall back to `default`.
fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim).map(str::to_ascii_lowercase) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "unibus");
        assert_eq!(config.log_level, "info");
        assert!(!config.otlp_enabled);
        assert!(config.console_output);
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag(Some("TRUE".into()), false));
        assert!(flag(Some(" 1 ".into()), false));
        assert!(!flag(Some("off".into()), true));
        assert!(flag(Some("maybe".into()), true));
        assert!(!flag(None, false));
    }

    #[test]
    fn test_for_service_overrides_name() {
        let config = TelemetryConfig::for_service("billing-consumer");
        assert_eq!(config.service_name, "billing-consumer");
    }
}
