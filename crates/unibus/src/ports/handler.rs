//! Message handlers and closure adapters.

use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{BrokerError, Headers, Publication};

/// Receives deliveries for one subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, publication: &Publication) -> Result<(), BrokerError>;

    /// Batched delivery, in order; stops at the first error.
    async fn handle_batch(&self, batch: &[Publication]) -> Result<(), BrokerError> {
        for publication in batch {
            self.handle(publication).await?;
        }
        Ok(())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Publication) -> Result<(), BrokerError> + Send + Sync,
{
    async fn handle(&self, publication: &Publication) -> Result<(), BrokerError> {
        (self.0)(publication)
    }
}

/// Synchronous closure over the publication; may call `ack()` directly.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Publication) -> Result<(), BrokerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Decoded delivery handed to a typed closure.
#[derive(Debug, Clone)]
pub struct TypedEvent<T> {
    pub topic: String,
    pub headers: Headers,
    pub payload: Arc<T>,
}

struct TypedHandler<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Handler for TypedHandler<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(TypedEvent<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BrokerError>> + Send,
{
    async fn handle(&self, publication: &Publication) -> Result<(), BrokerError> {
        let Some(payload) = publication.body().downcast_arc::<T>() else {
            return Err(BrokerError::Handler(format!(
                "unsupported type: expected {}",
                type_name::<T>()
            )));
        };
        (self.f)(TypedEvent {
            topic: publication.topic().to_string(),
            headers: publication.headers().clone(),
            payload,
        })
        .await
    }
}

/// Async closure receiving values decoded by `binder::<T>()`.
pub fn typed_handler<T, F, Fut>(f: F) -> Arc<dyn Handler>
where
    T: Send + Sync + 'static,
    F: Fn(TypedEvent<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _marker: PhantomData,
    })
}

/// Undecoded delivery handed to a raw closure.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub topic: String,
    pub headers: Headers,
    pub payload: Bytes,
}

struct RawHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for RawHandler<F>
where
    F: Fn(RawEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BrokerError>> + Send,
{
    async fn handle(&self, publication: &Publication) -> Result<(), BrokerError> {
        let Some(payload) = publication.body().as_raw() else {
            return Err(BrokerError::Handler(
                "unsupported type: expected raw bytes".into(),
            ));
        };
        (self.0)(RawEvent {
            topic: publication.topic().to_string(),
            headers: publication.headers().clone(),
            payload: payload.clone(),
        })
        .await
    }
}

/// Async closure over undecoded bytes (subscribe without a binder).
pub fn raw_handler<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(RawEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
{
    Arc::new(RawHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Body, Delivery, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publication(body: Body) -> Publication {
        Publication::new(
            "t",
            Message {
                headers: Headers::new(),
                body,
            },
            Delivery::None,
        )
    }

    #[tokio::test]
    async fn test_typed_handler_receives_value() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        let handler = typed_handler(move |event: TypedEvent<u32>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.store(*event.payload as usize, Ordering::SeqCst);
                Ok(())
            }
        });

        handler
            .handle(&publication(Body::Decoded(Arc::new(7u32))))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_other_types() {
        let handler = typed_handler(|_: TypedEvent<u32>| async { Ok(()) });
        let err = handler
            .handle(&publication(Body::Raw(Bytes::from_static(b"7"))))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Handler(msg) if msg.starts_with("unsupported type")));
    }

    #[tokio::test]
    async fn test_default_batch_stops_at_first_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            if p.body().as_raw().is_some_and(|b| b.as_ref() == b"bad") {
                return Err(BrokerError::handler("bad record"));
            }
            Ok(())
        });

        let batch = vec![
            publication(Body::Raw(Bytes::from_static(b"ok"))),
            publication(Body::Raw(Bytes::from_static(b"bad"))),
            publication(Body::Raw(Bytes::from_static(b"never"))),
        ];
        assert!(handler.handle_batch(&batch).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_raw_handler() {
        let handler = raw_handler(|event: RawEvent| async move {
            assert_eq!(event.payload.as_ref(), b"hi");
            Ok(())
        });
        handler
            .handle(&publication(Body::Raw(Bytes::from_static(b"hi"))))
            .await
            .unwrap();
    }
}
