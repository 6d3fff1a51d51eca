//! Message model: headers, bodies, outbound payloads and delivery coordinates.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::errors::BrokerError;

/// String header carrier shared by user metadata and trace propagation.
pub type Headers = HashMap<String, String>;

/// Message body: raw bytes before decode, a typed value after decode.
#[derive(Clone)]
pub enum Body {
    Raw(Bytes),
    Decoded(Arc<dyn Any + Send + Sync>),
}

impl Body {
    #[must_use]
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Body::Raw(bytes) => Some(bytes),
            Body::Decoded(_) => None,
        }
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Decoded(value) => value.downcast_ref::<T>(),
            Body::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Body::Decoded(value) => Arc::clone(value).downcast::<T>().ok(),
            Body::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn is_decoded(&self) -> bool {
        matches!(self, Body::Decoded(_))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            Body::Decoded(_) => f.write_str("Decoded(..)"),
        }
    }
}

/// One message as seen by a handler.
#[derive(Debug, Clone)]
pub struct Message {
    pub headers: Headers,
    pub body: Body,
}

/// Outbound payload handed to `publish`.
///
/// `Raw` bypasses the codec registry entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Structured(serde_json::Value),
}

impl Payload {
    /// Capture any serializable value for encoding by the configured codec.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, BrokerError> {
        serde_json::to_value(value)
            .map(Payload::Structured)
            .map_err(|e| BrokerError::Marshal(e.to_string()))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(bytes))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Raw(Bytes::from_static(text.as_bytes()))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Structured(value)
    }
}

/// Backend coordinates an acknowledgement is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Partitioned log position.
    Offset { partition: i32, offset: i64 },
    /// Broker-tracked delivery tag.
    Tag(u64),
    /// Session packet identifier.
    PacketId(u16),
    /// No coordinates; acknowledgement is a no-op.
    None,
}

/// Outcome of a successful send, attached to the producer span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub partition: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        temperature: f64,
    }

    #[test]
    fn test_body_downcast() {
        let body = Body::Decoded(Arc::new(Reading { temperature: 1.5 }));
        assert!(body.is_decoded());
        assert_eq!(body.downcast_ref::<Reading>().unwrap().temperature, 1.5);
        assert!(body.downcast_ref::<String>().is_none());
        assert!(body.downcast_arc::<Reading>().is_some());
        assert!(body.as_raw().is_none());
    }

    #[test]
    fn test_raw_body_has_no_typed_view() {
        let body = Body::Raw(Bytes::from_static(b"abc"));
        assert_eq!(body.as_raw().unwrap().as_ref(), b"abc");
        assert!(body.downcast_ref::<Reading>().is_none());
    }

    #[test]
    fn test_payload_from_value() {
        let payload = Payload::from_value(&Reading { temperature: 23.5 }).unwrap();
        assert_eq!(
            payload,
            Payload::Structured(serde_json::json!({"temperature": 23.5}))
        );
    }
}
