//! In-process MQTT-style session server implementing [`SessionClient`].
//!
//! One [`MemorySessionBroker`] hands out any number of clients. Publishing
//! on one client routes to every connected client holding a matching
//! filter. Clean sessions drop their filters on reconnect; retained
//! messages replay to new matching subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::{BackendError, Headers, QoS, TopicFilter};
use crate::ports::{SessionClient, SessionConfig, SessionEvent, SessionMessage};

const EVENT_CAPACITY: usize = 16;

type Route = (TopicFilter, QoS, mpsc::Sender<SessionMessage>);

struct ClientShared {
    connected: AtomicBool,
    connect_attempts: AtomicUsize,
    client_id: Mutex<Option<String>>,
    routes: Mutex<Vec<Route>>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct ServerState {
    refusing: usize,
    clients: Vec<Arc<ClientShared>>,
    next_packet: u16,
    retained: HashMap<String, SessionMessage>,
}

impl ServerState {
    fn packet_id(&mut self, qos: QoS) -> u16 {
        if qos == QoS::AtMostOnce {
            return 0;
        }
        self.next_packet = self.next_packet.wrapping_add(1).max(1);
        self.next_packet
    }
}

fn downgrade(published: QoS, granted: QoS) -> QoS {
    let rank = |qos: QoS| match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    };
    if rank(published) <= rank(granted) {
        published
    } else {
        granted
    }
}

/// Shared in-process session server.
#[derive(Clone, Default)]
pub struct MemorySessionBroker {
    state: Arc<Mutex<ServerState>>,
}

impl MemorySessionBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New disconnected client attached to this server.
    #[must_use]
    pub fn client(&self) -> MemorySessionClient {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ClientShared {
            connected: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            client_id: Mutex::new(None),
            routes: Mutex::new(Vec::new()),
            events,
        });
        self.state.lock().clients.push(Arc::clone(&shared));
        MemorySessionClient {
            server: self.clone(),
            shared,
        }
    }

    /// Refuse the next `count` connection attempts from any client.
    pub fn refuse_connections(&self, count: usize) {
        self.state.lock().refusing = count;
    }

    #[must_use]
    pub fn connected_clients(&self) -> usize {
        self.state
            .lock()
            .clients
            .iter()
            .filter(|c| c.connected.load(Ordering::Acquire))
            .count()
    }
}

/// Client handle onto a [`MemorySessionBroker`]. Clones share the session.
#[derive(Clone)]
pub struct MemorySessionClient {
    server: MemorySessionBroker,
    shared: Arc<ClientShared>,
}

impl MemorySessionClient {
    /// Drop the session and emit [`SessionEvent::ConnectionLost`].
    pub fn simulate_connection_loss(&self) {
        self.shared.connected.store(false, Ordering::Release);
        let _ = self
            .shared
            .events
            .send(SessionEvent::ConnectionLost("connection reset by peer".into()));
    }

    /// Connect calls made so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::Acquire)
    }

    /// Active subscription filters, sorted.
    #[must_use]
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<_> = self
            .shared
            .routes
            .lock()
            .iter()
            .map(|(filter, _, _)| filter.as_str().to_string())
            .collect();
        filters.sort();
        filters
    }

    /// Client id of the last successful connect.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BackendError::SessionClosed)
        }
    }
}

fn deliver(sink: &mpsc::Sender<SessionMessage>, message: SessionMessage) {
    if let Err(err) = sink.try_send(message) {
        warn!(error = %err, "Session subscriber buffer full, message dropped");
    }
}

#[async_trait]
impl SessionClient for MemorySessionClient {
    async fn connect(&self, config: &SessionConfig) -> Result<(), BackendError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::AcqRel);
        {
            let mut state = self.server.state.lock();
            if state.refusing > 0 {
                state.refusing -= 1;
                return Err(BackendError::Unreachable(config.addresses.join(",")));
            }
        }

        if config.clean_session {
            self.shared.routes.lock().clear();
        }
        *self.shared.client_id.lock() = Some(config.client_id.clone());
        self.shared.connected.store(true, Ordering::Release);
        let _ = self.shared.events.send(SessionEvent::Connected);
        debug!(client_id = %config.client_id, clean_session = config.clean_session, "Session established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.shared.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        properties: Headers,
        payload: Bytes,
    ) -> Result<(), BackendError> {
        self.ensure_connected()?;

        let mut deliveries = Vec::new();
        {
            let mut state = self.server.state.lock();
            if retain {
                if payload.is_empty() {
                    state.retained.remove(topic);
                } else {
                    state.retained.insert(
                        topic.to_string(),
                        SessionMessage {
                            topic: topic.to_string(),
                            packet_id: 0,
                            qos,
                            retain: true,
                            properties: properties.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
            }

            let clients: Vec<_> = state
                .clients
                .iter()
                .filter(|c| c.connected.load(Ordering::Acquire))
                .cloned()
                .collect();
            for client in clients {
                for (filter, granted, sink) in client.routes.lock().iter() {
                    if filter.matches(topic) {
                        let qos = downgrade(qos, *granted);
                        deliveries.push((
                            sink.clone(),
                            SessionMessage {
                                topic: topic.to_string(),
                                packet_id: state.packet_id(qos),
                                qos,
                                retain: false,
                                properties: properties.clone(),
                                payload: payload.clone(),
                            },
                        ));
                    }
                }
            }
        }

        for (sink, message) in deliveries {
            deliver(&sink, message);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        sink: mpsc::Sender<SessionMessage>,
    ) -> Result<(), BackendError> {
        self.ensure_connected()?;
        let parsed =
            TopicFilter::parse(filter).map_err(|e| BackendError::Rejected(e.to_string()))?;

        let retained: Vec<_> = self
            .server
            .state
            .lock()
            .retained
            .values()
            .filter(|m| parsed.matches(&m.topic))
            .cloned()
            .collect();

        {
            let mut routes = self.shared.routes.lock();
            routes.retain(|(existing, _, _)| existing.as_str() != filter);
            routes.push((parsed, qos, sink.clone()));
        }
        for message in retained {
            deliver(&sink, message);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BackendError> {
        self.ensure_connected()?;
        self.shared
            .routes
            .lock()
            .retain(|(existing, _, _)| existing.as_str() != filter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(clean_session: bool) -> SessionConfig {
        SessionConfig {
            addresses: vec!["tcp://127.0.0.1:1883".into()],
            client_id: "sensor-7".into(),
            clean_session,
            credentials: None,
            tls: None,
        }
    }

    #[tokio::test]
    async fn test_routes_to_matching_clients_only() {
        let server = MemorySessionBroker::new();
        let publisher = server.client();
        let listener = server.client();
        publisher.connect(&config(true)).await.unwrap();
        listener.connect(&config(true)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        listener
            .subscribe("site/+/temp", QoS::AtLeastOnce, tx)
            .await
            .unwrap();

        for topic in ["site/a/humidity", "site/a/temp"] {
            publisher
                .publish(
                    topic,
                    QoS::AtLeastOnce,
                    false,
                    Headers::new(),
                    Bytes::from_static(b"21"),
                )
                .await
                .unwrap();
        }

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "site/a/temp");
        assert_ne!(message.packet_id, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clean_session_drops_filters_on_reconnect() {
        let server = MemorySessionBroker::new();
        let client = server.client();
        client.connect(&config(false)).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        client.subscribe("a/#", QoS::AtLeastOnce, tx).await.unwrap();

        client.simulate_connection_loss();
        client.connect(&config(false)).await.unwrap();
        assert_eq!(client.filters(), vec!["a/#".to_string()]);

        client.simulate_connection_loss();
        client.connect(&config(true)).await.unwrap();
        assert!(client.filters().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connections_then_success() {
        let server = MemorySessionBroker::new();
        let client = server.client();
        let mut events = client.events();
        server.refuse_connections(2);

        for _ in 0..2 {
            assert!(matches!(
                client.connect(&config(true)).await,
                Err(BackendError::Unreachable(_))
            ));
        }
        client.connect(&config(true)).await.unwrap();
        assert_eq!(client.connect_attempts(), 3);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        assert_eq!(client.client_id().as_deref(), Some("sensor-7"));
    }

    #[tokio::test]
    async fn test_retained_message_replays_to_new_subscriber() {
        let server = MemorySessionBroker::new();
        let client = server.client();
        client.connect(&config(true)).await.unwrap();
        client
            .publish(
                "status/gw",
                QoS::AtLeastOnce,
                true,
                Headers::new(),
                Bytes::from_static(b"online"),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        client.subscribe("status/#", QoS::AtMostOnce, tx).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert!(message.retain);
        assert_eq!(message.payload, Bytes::from_static(b"online"));
    }

    #[tokio::test]
    async fn test_io_requires_session() {
        let server = MemorySessionBroker::new();
        let client = server.client();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            client.subscribe("a", QoS::AtLeastOnce, tx).await.unwrap_err(),
            BackendError::SessionClosed
        );
        assert_eq!(server.connected_clients(), 0);
    }

    #[test]
    fn test_qos_downgrade() {
        assert_eq!(downgrade(QoS::ExactlyOnce, QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(downgrade(QoS::AtMostOnce, QoS::ExactlyOnce), QoS::AtMostOnce);
    }
}
