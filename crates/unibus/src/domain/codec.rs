//! Codec registry and typed binders.
//!
//! Codecs translate between bytes and `serde_json::Value`, the neutral data
//! model every structured payload passes through. A [`Binder`] supplies the
//! empty typed destination the decoded value is bound into.
//!
//! ```text
//!  publish:   Payload::Structured(Value) ──codec.encode──▶ bytes
//!  receive:   bytes ──codec.decode──▶ Value ──binder().bind──▶ Body::Decoded(Arc<T>)
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::BrokerError;
use super::message::{Body, Payload};

/// Named byte-level (de)serialization strategy.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError>;
    fn decode(&self, data: &[u8]) -> Result<Value, BrokerError>;
}

/// `json` codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(value).map_err(|e| BrokerError::Marshal(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, BrokerError> {
        serde_json::from_slice(data).map_err(|e| BrokerError::Unmarshal(e.to_string()))
    }
}

/// `msgpack` codec, maps keyed by field name.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        rmp_serde::to_vec_named(value).map_err(|e| BrokerError::Marshal(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, BrokerError> {
        rmp_serde::from_slice(data).map_err(|e| BrokerError::Unmarshal(e.to_string()))
    }
}

/// Empty typed destination produced by a [`Binder`].
pub trait BindTarget: Send {
    fn bind(&mut self, value: Value) -> Result<(), BrokerError>;
    fn into_body(self: Box<Self>) -> Option<Arc<dyn Any + Send + Sync>>;
}

struct TypedTarget<T>(Option<T>);

impl<T> BindTarget for TypedTarget<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn bind(&mut self, value: Value) -> Result<(), BrokerError> {
        let typed = serde_json::from_value::<T>(value).map_err(|e| {
            BrokerError::Unmarshal(format!("{}: {e}", std::any::type_name::<T>()))
        })?;
        self.0 = Some(typed);
        Ok(())
    }

    fn into_body(self: Box<Self>) -> Option<Arc<dyn Any + Send + Sync>> {
        self.0.map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
    }
}

/// Factory for typed decode destinations.
pub type Binder = Arc<dyn Fn() -> Box<dyn BindTarget> + Send + Sync>;

/// Binder decoding into `T`.
#[must_use]
pub fn binder<T>() -> Binder
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(|| Box::new(TypedTarget::<T>(None)) as Box<dyn BindTarget>)
}

/// Codecs keyed by identifier.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry with no codecs; only raw payloads can pass.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding `json` and `msgpack`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(MsgPackCodec));
        registry
    }

    /// Add or replace a codec by its name.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name().to_owned(), codec);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }

    /// Turn an outbound payload into bytes. Raw payloads pass through.
    pub fn encode(&self, codec: &str, payload: Payload) -> Result<Bytes, BrokerError> {
        match payload {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Structured(value) => {
                let codec = self.get(codec).ok_or_else(|| {
                    BrokerError::Marshal(format!("codec '{codec}' is not registered"))
                })?;
                codec.encode(&value).map(Bytes::from)
            }
        }
    }

    /// Decode inbound bytes into the binder's type, or keep them raw without one.
    pub fn decode(
        &self,
        codec: &str,
        data: &Bytes,
        binder: Option<&Binder>,
    ) -> Result<Body, BrokerError> {
        let Some(binder) = binder else {
            return Ok(Body::Raw(data.clone()));
        };
        let codec = self.get(codec).ok_or_else(|| {
            BrokerError::Unmarshal(format!("codec '{codec}' is not registered"))
        })?;

        let mut target = binder();
        target.bind(codec.decode(data)?)?;
        target
            .into_body()
            .map(Body::Decoded)
            .ok_or_else(|| BrokerError::Unmarshal("binder produced no value".into()))
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.codecs.keys()).finish()
    }
}
