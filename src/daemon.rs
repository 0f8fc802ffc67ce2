//! Daemon lifecycle
//!
//! Builds every component from the configuration, owns the long-lived tasks
//! by name and tears them down in order: periodic tasks first, then the
//! broker session (publishing the offline state), then the hardware link.

use crate::config::{LinkKind, LinkSection, TelemetryConfig, SYSTEM_NODE};
use crate::error::{DaemonError, DaemonResult};
use crate::link::{DeviceKind, DeviceLink, LinkMonitor, SimulatedLink, TinkerforgeLink};
use crate::observability::{HealthServer, LogForwarder, LogReceiver};
use crate::registry::PropertyRegistry;
use crate::sampling::{declare_properties, SamplingLoop, SystemStatus};
use crate::sink::{InfluxWriter, MirrorLoop};
use crate::transport::mqtt::{StatePublisher, TopicBuilder};
use crate::transport::{BrokerSession, ConnectionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Time allowed for each task to finish after the shutdown signal
const TASK_GRACE: Duration = Duration::from_secs(5);

struct DaemonTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct TelemetryDaemon {
    config: TelemetryConfig,
    registry: Arc<PropertyRegistry>,
    link: Arc<dyn DeviceLink>,
    session: Option<BrokerSession>,
    monitor: Option<Arc<LinkMonitor>>,
    status_rx: Option<watch::Receiver<SystemStatus>>,
    log_records: Option<LogReceiver>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<DaemonTask>,
}

impl TelemetryDaemon {
    /// Build a daemon with the link selected by `config.link.kind`
    pub fn from_config(config: TelemetryConfig) -> DaemonResult<Self> {
        let link = build_link(&config.link);
        Self::new(config, link)
    }

    /// Build a daemon around an existing link and declare the property schema
    pub fn new(config: TelemetryConfig, link: Arc<dyn DeviceLink>) -> DaemonResult<Self> {
        let registry = Arc::new(PropertyRegistry::new());
        declare_properties(&registry, &config)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            link,
            session: None,
            monitor: None,
            status_rx: None,
            log_records: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Forward captured log lines to `logging.mqtt_topic` once the session exists
    pub fn with_log_forwarding(mut self, records: LogReceiver) -> Self {
        self.log_records = Some(records);
        self
    }

    pub fn registry(&self) -> &Arc<PropertyRegistry> {
        &self.registry
    }

    pub fn broker_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.session.as_ref().map(BrokerSession::state_receiver)
    }

    pub fn link_monitor(&self) -> Option<&Arc<LinkMonitor>> {
        self.monitor.as_ref()
    }

    pub fn system_status(&self) -> Option<watch::Receiver<SystemStatus>> {
        self.status_rx.clone()
    }

    /// Names of the running tasks, in start order
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.name).collect()
    }

    fn spawn(&mut self, name: &'static str, handle: JoinHandle<()>) {
        info!(task = name, "Task started");
        self.tasks.push(DaemonTask { name, handle });
    }

    /// Connect the broker session, start the link and spawn the periodic tasks
    pub async fn start(&mut self) -> DaemonResult<()> {
        if self.session.is_some() {
            return Err(DaemonError::AlreadyStarted);
        }
        let span = crate::lifecycle_span!(phase = "startup", device = %self.config.device.id);
        self.start_tasks().instrument(span).await
    }

    async fn start_tasks(&mut self) -> DaemonResult<()> {
        let device_id = self.config.device.id.clone();
        info!(properties = self.registry.len(), "Starting telemetry daemon");
        self.shutdown_tx.send_replace(false);

        let mut session = BrokerSession::new(
            &device_id,
            self.config.mqtt.clone(),
            self.registry.clone(),
            self.state_publisher(),
            crate::session_span!(device = %device_id),
        )?;
        session.connect()?;
        let broker_state = session.state_receiver();
        let session_sink = session.sink();
        self.session = Some(session);

        let log_topic = self.config.logging.mqtt_topic.clone();
        if let (Some(records), Some(topic)) = (self.log_records.take(), log_topic) {
            let forwarder = LogForwarder::new(session_sink, topic);
            let handle = tokio::spawn(forwarder.run(records, self.shutdown_tx.subscribe()));
            self.spawn("log-forwarder", handle);
        }

        let wanted = self.config.sensors.iter().map(|s| DeviceKind::from(s.kind));
        let monitor = Arc::new(LinkMonitor::new(self.link.clone(), wanted));
        let handle = monitor
            .start(
                self.shutdown_tx.subscribe(),
                crate::link_span!(kind = ?self.config.link.kind, host = %self.config.link.host),
            )
            .await?;
        self.spawn("link-monitor", handle);
        self.monitor = Some(monitor.clone());

        let sampler = SamplingLoop::new(self.registry.clone(), monitor.clone(), &self.config);
        let status_rx = sampler.status_receiver();
        self.status_rx = Some(status_rx.clone());
        let handle = tokio::spawn(
            sampler
                .run(self.shutdown_tx.subscribe())
                .instrument(crate::sampling_span!(period_secs = self.config.sampling.period_secs)),
        );
        self.spawn("sampling", handle);

        if let Some(sink) = self.config.sink.clone() {
            let token = self.config.get_sink_token()?;
            let writer = Arc::new(InfluxWriter::new(&sink, token)?);
            let mirror = MirrorLoop::new(self.registry.clone(), writer, &sink, &device_id);
            let handle = tokio::spawn(
                mirror
                    .run(self.shutdown_tx.subscribe())
                    .instrument(crate::sink_span!(bucket = %sink.bucket)),
            );
            self.spawn("time-series-mirror", handle);
        }

        if let Some(port) = self.config.health.as_ref().map(|health| health.port) {
            let server = Arc::new(HealthServer::new(
                &device_id,
                port,
                broker_state,
                monitor.generation_receiver(),
                status_rx,
            ));
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                if let Err(e) = server.serve(shutdown_rx).await {
                    error!("Health server error: {}", e);
                }
            });
            self.spawn("health-server", handle);
        }

        info!(tasks = ?self.task_names(), "Telemetry daemon started");
        Ok(())
    }

    /// Resolves once the broker session has given up reconnecting
    pub async fn broker_lost(&self) {
        loop {
            match &self.session {
                Some(session) if !session.is_running() => return,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    fn state_publisher(&self) -> StatePublisher {
        let topics = TopicBuilder::new(&self.config.mqtt.base_topic, &self.config.device.id);
        let publisher =
            StatePublisher::new(self.registry.clone(), topics, &self.config.device.name)
                .with_node_name(SYSTEM_NODE, "System");
        self.config
            .sensors
            .iter()
            .fold(publisher, |publisher, sensor| {
                publisher.with_node_name(&sensor.node, sensor.display_name())
            })
    }

    /// Stop tasks, announce the offline state, close the session, release the link
    pub async fn shutdown(&mut self) -> DaemonResult<()> {
        let span = crate::lifecycle_span!(phase = "shutdown", device = %self.config.device.id);
        self.stop_tasks().instrument(span).await
    }

    async fn stop_tasks(&mut self) -> DaemonResult<()> {
        info!("Shutting down telemetry daemon");
        self.shutdown_tx.send_replace(true);

        for DaemonTask { name, handle } in self.tasks.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(TASK_GRACE, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) if !e.is_cancelled() => error!(task = name, "Task failed: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let session_result = match self.session.take() {
            Some(mut session) => session.disconnect().await,
            None => Ok(()),
        };

        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }

        info!("Telemetry daemon stopped");
        session_result.map_err(DaemonError::from)
    }
}

/// Device link for the configured kind
pub fn build_link(config: &LinkSection) -> Arc<dyn DeviceLink> {
    match config.kind {
        LinkKind::Tinkerforge => Arc::new(TinkerforgeLink::new(
            &config.host,
            config.port,
            Duration::from_millis(config.read_timeout_ms),
            Duration::from_millis(config.reconnect_delay_ms),
        )),
        LinkKind::Simulated => Arc::new(SimulatedLink::new(config.failure_rate)),
    }
}
