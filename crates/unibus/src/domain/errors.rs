//! Error taxonomy shared by every adapter.
//!
//! | Variant | Raised by |
//! |---------|-----------|
//! | `Configuration` | `init`, option builders, subscribe without a group |
//! | `Connection` | `connect` handshake failures |
//! | `NotConnected` | publish/subscribe before `connect` |
//! | `Marshal` / `Unmarshal` | codec failures |
//! | `Protocol` | backend send/receive/subscribe rejections |
//! | `Handler` | user handler code |
//! | `Closed` | operations on an unsubscribed handle |

use thiserror::Error;

/// Errors surfaced through the broker contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Invalid or missing address, codec or option value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connect or handshake failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted before `connect`.
    #[error("Broker is not connected")]
    NotConnected,

    /// The codec rejected the outbound value.
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// The codec rejected the inbound bytes.
    #[error("Unmarshal error: {0}")]
    Unmarshal(String),

    /// Backend-specific send, receive or subscribe rejection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Propagated from user handler code.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The subscriber has already been closed.
    #[error("Subscriber is closed")]
    Closed,
}

impl BrokerError {
    /// Wrap any displayable error coming out of handler code.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }

    /// Short stable label, used as a metrics label and log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::NotConnected => "not_connected",
            Self::Marshal(_) => "marshal",
            Self::Unmarshal(_) => "unmarshal",
            Self::Protocol(_) => "protocol",
            Self::Handler(_) => "handler",
            Self::Closed => "closed",
        }
    }
}

/// Errors reported by a native client port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Request timed out")]
    Timeout,
}

impl BackendError {
    /// Map a handshake failure.
    #[must_use]
    pub fn into_connection(self) -> BrokerError {
        BrokerError::Connection(self.to_string())
    }
}

impl From<BackendError> for BrokerError {
    fn from(err: BackendError) -> Self {
        BrokerError::Protocol(err.to_string())
    }
}

/// Fold the failures collected during teardown into one result.
pub(crate) fn collect_teardown(errors: Vec<BrokerError>) -> Result<(), BrokerError> {
    if errors.is_empty() {
        return Ok(());
    }
    let detail = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(BrokerError::Protocol(format!(
        "disconnect: {} teardown failures: {detail}",
        errors.len()
    )))
}
