//! Session (MQTT-style) adapter.
//!
//! ## Semantics
//!
//! - Delivery is QoS-based; packet ids are tracked by the session client, so
//!   publications carry [`Delivery::PacketId`] and have no commit step.
//! - Subscriptions take topic filters with `+` and `#` wildcards.
//! - The adapter owns reconnection. A session watcher listens for
//!   [`SessionEvent::ConnectionLost`], moves the state to `Reconnecting` and
//!   retries every `reconnect_interval` until a connect succeeds. Clean
//!   sessions lose their subscriptions on the server, so the watcher
//!   re-issues every live filter before reporting `Connected` again.
//! - The session client keeps one route per filter. Local subscriptions on
//!   the same filter share it through a fan-out task, and the filter is only
//!   unsubscribed at the session when its last subscription goes away.
//!
//! ```text
//!  Connected ──ConnectionLost──▶ Reconnecting ──connect ok──▶ Connected
//!                                   │    ▲
//!                                   └────┘ sleep(reconnect_interval)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use unibus_telemetry::metrics;
use uuid::Uuid;

use super::common::{AdapterCore, Dispatcher, Incoming};
use crate::domain::{
    Binder, BrokerError, BrokerOptions, ConnectionState, Delivery, Payload, PublishOptions, QoS,
    SendReceipt, StateCell, SubscribeOptions, TopicFilter,
};
use crate::ports::{Broker, Handler, SessionClient, SessionConfig, SessionEvent, SessionMessage};
use crate::subscriber::{Subscriber, Teardown};

const SYSTEM: &str = "mqtt";

/// Address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "tcp://127.0.0.1:1883";

/// Messages buffered per subscription between the session client and the handler.
const SUBSCRIPTION_BUFFER: usize = 256;

type Sinks = Arc<RwLock<HashMap<Uuid, mpsc::Sender<SessionMessage>>>>;

/// The session-side sink for one filter and the subscriptions it feeds.
struct FilterRoute {
    inbound: mpsc::Sender<SessionMessage>,
    subscribers: Sinks,
}

type Routes = Arc<RwLock<HashMap<String, FilterRoute>>>;

struct Watcher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Broker over a [`SessionClient`].
pub struct MqttBroker {
    core: AdapterCore,
    client: Arc<dyn SessionClient>,
    routes: Routes,
    /// Serializes filter changes at the session with route bookkeeping.
    filter_ops: Arc<AsyncMutex<()>>,
    watcher: Mutex<Option<Watcher>>,
}

impl MqttBroker {
    pub fn new(client: Arc<dyn SessionClient>, options: BrokerOptions) -> Self {
        Self {
            core: AdapterCore::new(SYSTEM, options),
            client,
            routes: Arc::new(RwLock::new(HashMap::new())),
            filter_ops: Arc::new(AsyncMutex::new(())),
            watcher: Mutex::new(None),
        }
    }

    fn session_config(&self) -> SessionConfig {
        let options = self.core.options();
        let mqtt = options.mqtt();
        SessionConfig {
            addresses: if options.addresses().is_empty() {
                vec![DEFAULT_ADDRESS.to_string()]
            } else {
                options.addresses().to_vec()
            },
            client_id: mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| format!("unibus-{}", Uuid::new_v4().simple())),
            clean_session: mqtt.clean_session,
            credentials: mqtt.credentials.clone(),
            tls: options.tls().cloned(),
        }
    }

    async fn stop_watcher(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.shutdown.send(true);
            if let Err(err) = watcher.task.await {
                warn!(error = %err, "Session watcher ended abnormally");
            }
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    fn name(&self) -> &'static str {
        SYSTEM
    }

    fn address(&self) -> String {
        self.core.options().address_or(DEFAULT_ADDRESS)
    }

    fn options(&self) -> BrokerOptions {
        self.core.options()
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state().get()
    }

    async fn init(&self, options: BrokerOptions) -> Result<(), BrokerError> {
        self.core.init(options)
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.core.state().get() != ConnectionState::Disconnected {
            return Ok(());
        }
        let config = self.session_config();

        // Subscribe before connecting so a loss right after connect is seen.
        let events = self.client.events();
        self.client
            .connect(&config)
            .await
            .map_err(|e| e.into_connection())?;
        self.core.state().set(ConnectionState::Connected);

        let options = self.core.options();
        let (shutdown, signal) = watch::channel(false);
        let session = Session {
            client: Arc::clone(&self.client),
            config: config.clone(),
            routes: Arc::clone(&self.routes),
            filter_ops: Arc::clone(&self.filter_ops),
            state: self.core.state().clone(),
            qos: options.mqtt().qos,
            interval: options.mqtt().reconnect_interval,
        };
        let task = tokio::spawn(session.watch(events, signal));
        *self.watcher.lock() = Some(Watcher { shutdown, task });

        info!(system = SYSTEM, client_id = %config.client_id, "Broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if self.core.state().get() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.stop_watcher().await;

        let result = self
            .core
            .shutdown(async {
                self.routes.write().clear();
                match self.client.disconnect().await {
                    Ok(()) => Vec::new(),
                    Err(err) => vec![err.into()],
                }
            })
            .await;
        info!(system = SYSTEM, "Broker disconnected");
        result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        self.core.ensure_connected()?;
        if topic.contains(&['+', '#'][..]) {
            return Err(BrokerError::Protocol(format!(
                "cannot publish to wildcard topic: {topic}"
            )));
        }
        let payload = self.core.encode(payload)?;
        let mqtt = self.core.options().mqtt().clone();

        let bridge = self.core.bridge();
        let mut properties = options.headers;
        let span =
            bridge.start_producer_span(topic, &mut properties, options.trace_context.as_ref());

        let result = self
            .client
            .publish(topic, mqtt.qos, mqtt.retain, properties, payload)
            .await
            .map_err(BrokerError::from);
        let receipt = SendReceipt {
            message_id: String::new(),
            partition: None,
        };
        bridge.finish_producer_span(span, result.as_ref().map(|()| &receipt));

        match result {
            Ok(()) => {
                metrics::record_published(SYSTEM, topic);
                debug!(topic, qos = ?mqtt.qos, "Message published");
                Ok(())
            }
            Err(err) => {
                metrics::record_publish_failure(SYSTEM, topic);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        binder: Option<Binder>,
        options: SubscribeOptions,
    ) -> Result<Subscriber, BrokerError> {
        self.core.ensure_connected()?;
        let filter = TopicFilter::parse(topic)?;
        let qos = self.core.options().mqtt().qos;

        let (sink, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let route_id = Uuid::new_v4();
        {
            let _ops = self.filter_ops.lock().await;
            let shared = self
                .routes
                .read()
                .get(filter.as_str())
                .map(|route| Arc::clone(&route.subscribers));
            match shared {
                Some(subscribers) => {
                    subscribers.write().insert(route_id, sink);
                    debug!(filter = %filter.as_str(), "Joined existing session filter");
                }
                None => {
                    let (inbound, fanned) = mpsc::channel(SUBSCRIPTION_BUFFER);
                    self.client
                        .subscribe(filter.as_str(), qos, inbound.clone())
                        .await
                        .map_err(BrokerError::from)?;
                    let subscribers: Sinks =
                        Arc::new(RwLock::new(HashMap::from([(route_id, sink)])));
                    tokio::spawn(fan_out(fanned, Arc::clone(&subscribers)));
                    self.routes.write().insert(
                        filter.as_str().to_string(),
                        FilterRoute {
                            inbound,
                            subscribers,
                        },
                    );
                }
            }
        }

        let dispatcher = self.core.dispatcher(handler, binder, options.clone());
        let teardown = FilterTeardown {
            client: Arc::clone(&self.client),
            routes: Arc::clone(&self.routes),
            filter_ops: Arc::clone(&self.filter_ops),
            filter: filter.as_str().to_string(),
            route_id,
        };
        let queue_name = options.queue_name().map(str::to_string);
        let (subscriber, shutdown) =
            Subscriber::new(topic, queue_name, options, Some(Box::new(teardown)));

        subscriber.set_task(tokio::spawn(receive_loop(receiver, dispatcher, shutdown)));
        self.core.track(&subscriber);

        info!(filter = %filter.as_str(), wildcard = filter.has_wildcards(), qos = ?qos, "Subscribed");
        Ok(subscriber)
    }
}

struct FilterTeardown {
    client: Arc<dyn SessionClient>,
    routes: Routes,
    filter_ops: Arc<AsyncMutex<()>>,
    filter: String,
    route_id: Uuid,
}

#[async_trait]
impl Teardown for FilterTeardown {
    async fn teardown(&self) -> Result<(), BrokerError> {
        let _ops = self.filter_ops.lock().await;
        let emptied = {
            let mut routes = self.routes.write();
            let emptied = routes.get(&self.filter).is_some_and(|route| {
                let mut subscribers = route.subscribers.write();
                subscribers.remove(&self.route_id);
                subscribers.is_empty()
            });
            if emptied {
                routes.remove(&self.filter);
            }
            emptied
        };
        if !emptied {
            debug!(filter = %self.filter, "Session filter kept for remaining subscriptions");
            return Ok(());
        }
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client
            .unsubscribe(&self.filter)
            .await
            .map_err(BrokerError::from)
    }
}

/// State the session watcher needs after `connect` returns.
struct Session {
    client: Arc<dyn SessionClient>,
    config: SessionConfig,
    routes: Routes,
    filter_ops: Arc<AsyncMutex<()>>,
    state: StateCell,
    qos: QoS,
    interval: std::time::Duration,
}

impl Session {
    async fn watch(
        self,
        mut events: broadcast::Receiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(SessionEvent::ConnectionLost(reason)) => {
                        warn!(client_id = %self.config.client_id, reason = %reason, "Connection lost");
                        self.state.set(ConnectionState::Reconnecting);
                        if !self.reconnect(&mut shutdown).await {
                            break;
                        }
                    }
                    Ok(SessionEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Retry until connected; false when shutdown interrupts.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = sleep(self.interval) => {}
            }
            attempt += 1;
            metrics::record_reconnect_attempt(SYSTEM);

            match self.client.connect(&self.config).await {
                Ok(()) => {
                    if self.config.clean_session {
                        self.resubscribe().await;
                    }
                    self.state.set(ConnectionState::Connected);
                    info!(client_id = %self.config.client_id, attempt, "Reconnected");
                    return true;
                }
                Err(err) => {
                    warn!(client_id = %self.config.client_id, attempt, error = %err, "Reconnect attempt failed");
                }
            }
        }
    }

    async fn resubscribe(&self) {
        let _ops = self.filter_ops.lock().await;
        let routes: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(filter, route)| (filter.clone(), route.inbound.clone()))
            .collect();
        for (filter, sink) in routes {
            if let Err(err) = self.client.subscribe(&filter, self.qos, sink).await {
                warn!(filter = %filter, error = %err, "Resubscribe failed");
            }
        }
    }
}

/// Copies each message the session routes for a filter to every subscription on it.
async fn fan_out(mut inbound: mpsc::Receiver<SessionMessage>, subscribers: Sinks) {
    while let Some(message) = inbound.recv().await {
        let sinks: Vec<_> = subscribers.read().values().cloned().collect();
        for sink in sinks {
            // A closed sink belongs to a subscription that is shutting down.
            let _ = sink.send(message.clone()).await;
        }
    }
}

async fn receive_loop(
    mut receiver: mpsc::Receiver<SessionMessage>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = receiver.recv() => match message {
                Some(message) => {
                    let incoming = Incoming {
                        topic: message.topic.clone(),
                        headers: message.properties.clone(),
                        payload: message.payload.clone(),
                        delivery: Delivery::PacketId(message.packet_id),
                        message_id: Some(message.packet_id.to_string()),
                        partition: None,
                        raw: Box::new(message),
                        acker: None,
                    };
                    let _ = dispatcher.deliver(incoming).await;
                }
                None => break,
            }
        }
    }
}
