//! Broker session: the impure half of the MQTT transport
//!
//! Two tasks run per session. The poller drives the rumqttc event loop,
//! tracks [`ConnectionState`] and reconnects with backoff, recreating the
//! client and event loop each time. The publisher watches the state channel
//! and the registry and keeps the broker in sync through [`StatePublisher`].

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, TopicBuilder,
    STATE_ATTRIBUTE,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundMessage, MessageHandler, SubscriptionRouter};
use super::replay::{StatePublisher, SyncOutcome};
use crate::config::MqttSection;
use crate::registry::PropertyRegistry;
use crate::transport::PropertySink;
use async_trait::async_trait;
use rand::Rng;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Request queue depth between the client handle and the event loop
const CLIENT_CHANNEL_CAPACITY: usize = 64;
/// Inbound messages buffered per subscription
const SUBSCRIPTION_CAPACITY: usize = 32;
/// Time allowed for each task to wind down in [`BrokerSession::disconnect`]
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// `$state` published on an orderly shutdown
pub const DISCONNECTED_STATE: &str = "disconnected";

/// Lifecycle signal shared by the session tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionControl {
    Running,
    /// Publisher stops, poller flushes queued packets without reconnecting
    Closing,
    Stopped,
}

/// Result of [`BrokerSession::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Not connected; the registry replay will cover it
    Dropped,
}

/// [`PropertySink`] over the live client, refusing to publish unless connected
#[derive(Clone)]
pub struct SessionSink {
    client: Arc<Mutex<AsyncClient>>,
    state_rx: watch::Receiver<ConnectionState>,
}

#[async_trait]
impl PropertySink for SessionSink {
    type Error = MqttError;

    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        // Clone the handle so the lock is not held while the request queue is full
        let client = self.client.lock().await.clone();
        client
            .publish(topic, MessageHandler::property_qos(), retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn publish_transient(&self, topic: &str, payload: String) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        // try_publish: a full request queue drops the line instead of waiting
        let client = self.client.lock().await.clone();
        client
            .try_publish(topic, MessageHandler::log_qos(), false, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }
}

/// Connection to the broker plus the tasks that keep it alive
pub struct BrokerSession {
    device_id: String,
    config: MqttSection,
    topics: TopicBuilder,
    registry: Arc<PropertyRegistry>,
    publisher: Option<StatePublisher>,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<EventLoop>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    control_tx: watch::Sender<SessionControl>,
    router: Arc<Mutex<SubscriptionRouter>>,
    generation: Arc<AtomicU64>,
    poller_handle: Option<JoinHandle<()>>,
    publisher_handle: Option<JoinHandle<()>>,
    span: Span,
}

impl BrokerSession {
    pub fn new(
        device_id: &str,
        config: MqttSection,
        registry: Arc<PropertyRegistry>,
        publisher: StatePublisher,
        span: Span,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(device_id, &config)?;
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not started".to_string()));
        let (control_tx, _) = watch::channel(SessionControl::Running);

        Ok(Self {
            device_id: device_id.to_string(),
            topics: TopicBuilder::new(&config.base_topic, device_id),
            config,
            registry,
            publisher: Some(publisher),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(event_loop),
            state_tx: Arc::new(state_tx),
            state_rx,
            control_tx,
            router: Arc::new(Mutex::new(SubscriptionRouter::new())),
            generation: Arc::new(AtomicU64::new(0)),
            poller_handle: None,
            publisher_handle: None,
            span,
        })
    }

    fn create_connection(
        device_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(device_id, config)?;
        Ok(AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY))
    }

    /// Start the session tasks; returns immediately without waiting for ConnAck
    ///
    /// Calling it again while the session runs is a no-op.
    pub fn connect(&mut self) -> Result<(), MqttError> {
        if self.poller_handle.is_some() {
            debug!("Broker session already started");
            return Ok(());
        }
        let event_loop = self.event_loop.take().ok_or(MqttError::AlreadyStarted)?;
        let publisher = self.publisher.take().ok_or(MqttError::AlreadyStarted)?;

        transition(&self.state_tx, ConnectionEvent::ReconnectionStarted);

        let poller = Poller {
            device_id: self.device_id.clone(),
            config: self.config.clone(),
            reconnect: ReconnectConfig::from(&self.config.reconnect),
            connect_timeout: Duration::from_secs(self.config.connect_timeout_secs.max(1)),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            router: self.router.clone(),
            generation: self.generation.clone(),
            attempts: 0,
        };
        let control_rx = self.control_tx.subscribe();
        self.poller_handle = Some(tokio::spawn(
            poller.run(event_loop, control_rx).instrument(self.span.clone()),
        ));

        let sink = SessionSink {
            client: self.client.clone(),
            state_rx: self.state_rx.clone(),
        };
        self.publisher_handle = Some(tokio::spawn(
            run_publisher(
                publisher,
                sink,
                self.registry.clone(),
                self.state_rx.clone(),
                self.control_tx.subscribe(),
            )
            .instrument(self.span.clone()),
        ));

        info!(broker = %self.config.broker_url, "Broker session started");
        Ok(())
    }

    /// Publish a payload to an arbitrary topic
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<String>,
        retain: bool,
    ) -> Result<PublishOutcome, MqttError> {
        match self.sink().publish(topic, payload.into(), retain).await {
            Ok(()) => Ok(PublishOutcome::Sent),
            Err(MqttError::NotConnected { state }) => {
                debug!(topic, state = state.label(), "Dropping publish while not connected");
                Ok(PublishOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Receive inbound messages matching `filter`; re-subscribed after every reconnect
    pub async fn subscribe(
        &self,
        filter: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, MqttError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.router.lock().await.add(filter, tx);

        if self.state().is_connected() {
            let client = self.client.lock().await.clone();
            client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        }
        info!(filter, "Subscribed");
        Ok(rx)
    }

    /// Announce `$state=disconnected`, close the connection and join the tasks
    ///
    /// Only a live connection gets a DISCONNECT; otherwise the poller is
    /// stopped directly and the call still succeeds.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.control_tx.send_replace(SessionControl::Closing);
        if let Some(handle) = self.publisher_handle.take() {
            join_with_grace("publisher", handle).await;
        }

        let _ = self.registry.set(STATE_ATTRIBUTE, DISCONNECTED_STATE);
        let client = self.client.lock().await.clone();
        let connected = self.state().is_connected();

        let disconnect_result = if connected {
            if let Err(e) = client
                .publish(
                    self.topics.state_topic(),
                    MessageHandler::state_qos(),
                    true,
                    DISCONNECTED_STATE,
                )
                .await
            {
                warn!("Failed to publish final state: {}", e);
            }
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))
        } else {
            debug!(
                state = self.state().label(),
                "Broker not connected, skipping DISCONNECT"
            );
            self.control_tx.send_replace(SessionControl::Stopped);
            Ok(())
        };

        if let Some(mut handle) = self.poller_handle.take() {
            // Poller exits once the DISCONNECT is flushed or it sees Stopped
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Poller did not stop in time, stopping it");
                self.control_tx.send_replace(SessionControl::Stopped);
                join_with_grace("poller", handle).await;
            }
        }

        transition(&self.state_tx, ConnectionEvent::ClosedLocally);
        info!("Broker session closed");
        disconnect_result
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver for observing state changes (health endpoint, tests)
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// False once the poller has stopped, e.g. after exhausting `max_attempts`
    pub fn is_running(&self) -> bool {
        self.poller_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of successful connections so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn sink(&self) -> SessionSink {
        SessionSink {
            client: self.client.clone(),
            state_rx: self.state_rx.clone(),
        }
    }
}

async fn join_with_grace(name: &str, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(())) => debug!(task = name, "Session task shut down gracefully"),
        Ok(Err(e)) if !e.is_cancelled() => {
            warn!(task = name, "Session task ended with error: {}", e)
        }
        Ok(Err(_)) => {}
        Err(_) => {
            warn!(task = name, "Session task didn't shut down gracefully, aborting");
            abort.abort();
        }
    }
}

fn transition(state_tx: &watch::Sender<ConnectionState>, event: ConnectionEvent) {
    let next = HealthMonitor::determine_next_state(event);
    let previous = state_tx.send_replace(next.clone());
    HealthMonitor::log_state_transition(&previous, &next);
}

/// What one poll of the event loop produced
enum PollOutcome {
    Event(Event),
    Failed(String),
    TimedOut,
    Control,
}

struct Poller {
    device_id: String,
    config: MqttSection,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    router: Arc<Mutex<SubscriptionRouter>>,
    generation: Arc<AtomicU64>,
    attempts: u32,
}

impl Poller {
    async fn run(
        mut self,
        mut event_loop: EventLoop,
        mut control_rx: watch::Receiver<SessionControl>,
    ) {
        info!(device = %self.device_id, "Starting broker event loop");

        loop {
            let control = *control_rx.borrow();
            if control == SessionControl::Stopped {
                break;
            }
            let closing = control == SessionControl::Closing;
            let connecting = matches!(*self.state_tx.borrow(), ConnectionState::Connecting);

            let outcome = tokio::select! {
                biased;
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    PollOutcome::Control
                }
                outcome = poll_once(&mut event_loop, connecting, self.connect_timeout) => outcome,
            };

            match outcome {
                PollOutcome::Control => continue,
                PollOutcome::Event(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    match route {
                        EventRoute::DisconnectSent if closing => break,
                        EventRoute::Disconnected => {
                            if closing {
                                break;
                            }
                            let event = ConnectionEvent::DisconnectedByBroker;
                            if !self.recover(event, &mut event_loop, &control_rx).await {
                                break;
                            }
                        }
                        route => self.handle_route(route).await,
                    }
                }
                PollOutcome::Failed(reason) => {
                    if closing {
                        break;
                    }
                    error!("Broker event loop error: {}", reason);
                    let event = ConnectionEvent::NetworkError(reason);
                    if !self.recover(event, &mut event_loop, &control_rx).await {
                        break;
                    }
                }
                PollOutcome::TimedOut => {
                    if closing {
                        break;
                    }
                    let event = ConnectionEvent::ConnectTimeout;
                    if !self.recover(event, &mut event_loop, &control_rx).await {
                        break;
                    }
                }
            }
        }

        info!(device = %self.device_id, "Broker event loop stopped");
    }

    async fn handle_route(&mut self, route: EventRoute) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.attempts = 0;
                transition(&self.state_tx, ConnectionEvent::ConnAckReceived { generation });
                self.resubscribe().await;
            }
            EventRoute::MessageReceived(message) => {
                debug!(topic = %message.topic, "Received broker message");
                self.router.lock().await.forward(&message);
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(packet_id, "Subscription confirmed");
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "mqtt_transport", "Broker event: {}", event);
            }
            EventRoute::Disconnected | EventRoute::DisconnectSent | EventRoute::OutgoingEvent => {}
        }
    }

    async fn resubscribe(&self) {
        let filters = self.router.lock().await.filters();
        if filters.is_empty() {
            return;
        }
        let client = self.client.lock().await.clone();
        for filter in filters {
            // try_subscribe: this task is the one draining the request queue
            if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                error!("Failed to re-subscribe to {}: {}", filter, e);
            } else {
                debug!("Re-subscribed to: {}", filter);
            }
        }
    }

    /// Mark the session down, back off, and install a fresh client and event loop
    ///
    /// Returns false when the poller should stop.
    async fn recover(
        &mut self,
        event: ConnectionEvent,
        event_loop: &mut EventLoop,
        control_rx: &watch::Receiver<SessionControl>,
    ) -> bool {
        transition(&self.state_tx, event);

        loop {
            let jitter_sample: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            let shutdown_requested = *control_rx.borrow() != SessionControl::Running;
            let decision = HealthMonitor::should_attempt_reconnection(
                self.attempts,
                &self.reconnect,
                shutdown_requested,
                jitter_sample,
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    self.attempts = attempt;
                    info!(attempt, delay_ms, "Scheduling broker reconnection");

                    if !interruptible_sleep(control_rx.clone(), delay_ms).await {
                        return false;
                    }

                    match BrokerSession::create_connection(&self.device_id, &self.config) {
                        Ok((client, new_event_loop)) => {
                            *event_loop = new_event_loop;
                            *self.client.lock().await = client;
                            transition(&self.state_tx, ConnectionEvent::ReconnectionStarted);
                            return true;
                        }
                        Err(e) => {
                            error!("Failed to create new connection: {}", e);
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, stopping reconnection");
                    return false;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(
                        attempts = self.attempts,
                        "Max reconnection attempts exceeded, giving up on broker"
                    );
                    return false;
                }
            }
        }
    }
}

async fn poll_once(event_loop: &mut EventLoop, connecting: bool, timeout: Duration) -> PollOutcome {
    if connecting {
        match tokio::time::timeout(timeout, event_loop.poll()).await {
            Ok(Ok(event)) => PollOutcome::Event(event),
            Ok(Err(e)) => PollOutcome::Failed(e.to_string()),
            Err(_) => PollOutcome::TimedOut,
        }
    } else {
        match event_loop.poll().await {
            Ok(event) => PollOutcome::Event(event),
            Err(e) => PollOutcome::Failed(e.to_string()),
        }
    }
}

/// Sleep that ends early when the session leaves `Running`; returns false in that case
async fn interruptible_sleep(
    mut control_rx: watch::Receiver<SessionControl>,
    delay_ms: u64,
) -> bool {
    let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            changed = control_rx.changed() => {
                if changed.is_err() || *control_rx.borrow() != SessionControl::Running {
                    info!("Shutdown signal received during reconnection delay");
                    return false;
                }
            }
            _ = &mut sleep => return true,
        }
    }
}

async fn run_publisher(
    mut publisher: StatePublisher,
    sink: SessionSink,
    registry: Arc<PropertyRegistry>,
    mut state_rx: watch::Receiver<ConnectionState>,
    mut control_rx: watch::Receiver<SessionControl>,
) {
    loop {
        if *control_rx.borrow() != SessionControl::Running {
            break;
        }

        let state = state_rx.borrow_and_update().clone();
        match publisher.sync(&sink, &state).await {
            Ok(SyncOutcome::Replayed { generation, published }) => {
                info!(generation, published, "Retained state replayed");
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to sync registry to broker: {}", e),
        }

        tokio::select! {
            biased;
            changed = control_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = registry.changed() => {}
        }
    }

    debug!("Broker publisher stopped");
}
