//! The sampling task
//!
//! Each iteration reads every bound handle once, writes successful readings
//! into the registry, updates the failure counts and then recomputes the
//! aggregate status from those counts. Status transitions are written to
//! `system/status` and `$state`; uptime, IP address and (when enabled) CPU
//! temperature are refreshed every time.

use super::health::{HealthTracker, SystemStatus};
use super::smoothing::Smoother;
use super::{
    ip_address_text, parse_thermal_millidegrees, property_name, CPU_TEMPERATURE_PROPERTY,
    HEALTHY_MESSAGE, IP_ADDRESS_PROPERTY, STATUS_PROPERTY, THERMAL_ZONE_PATH, UPTIME_PROPERTY,
};
use crate::config::TelemetryConfig;
use crate::link::{DeviceHandle, DeviceKind, LinkError, LinkMonitor, Reading};
use crate::registry::PropertyRegistry;
use crate::transport::mqtt::STATE_ATTRIBUTE;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Outcome of one sampling iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Stale handles skipped without counting
    pub skipped: usize,
    pub status: SystemStatus,
    pub status_changed: bool,
    /// Extra wait requested because a handle just started failing
    pub recovery_delay: Option<Duration>,
}

pub struct SamplingLoop {
    registry: Arc<PropertyRegistry>,
    monitor: Arc<LinkMonitor>,
    nodes: HashMap<DeviceKind, String>,
    tracker: HealthTracker,
    smoother: Smoother,
    period: Duration,
    read_timeout: Duration,
    recovery_delay: Duration,
    alert_message: String,
    thermal_zone: Option<PathBuf>,
    started: Instant,
    status: Option<SystemStatus>,
    status_tx: watch::Sender<SystemStatus>,
}

impl SamplingLoop {
    pub fn new(
        registry: Arc<PropertyRegistry>,
        monitor: Arc<LinkMonitor>,
        config: &TelemetryConfig,
    ) -> Self {
        let nodes = config
            .sensors
            .iter()
            .map(|sensor| (DeviceKind::from(sensor.kind), sensor.node.clone()))
            .collect();
        let (status_tx, _) = watch::channel(SystemStatus::Healthy);

        Self {
            registry,
            monitor,
            nodes,
            tracker: HealthTracker::new(config.sampling.failure_threshold),
            smoother: Smoother::new(config.sampling.smoothing_window),
            period: Duration::from_secs(config.sampling.period_secs),
            read_timeout: Duration::from_millis(config.link.read_timeout_ms),
            recovery_delay: Duration::from_millis(config.sampling.recovery_delay_ms),
            alert_message: config.sampling.alert_message.clone(),
            thermal_zone: config
                .sampling
                .cpu_temperature
                .then(|| PathBuf::from(THERMAL_ZONE_PATH)),
            started: Instant::now(),
            status: None,
            status_tx,
        }
    }

    /// Read the CPU temperature from `path` instead of the kernel thermal zone
    pub fn with_thermal_zone(mut self, path: impl Into<PathBuf>) -> Self {
        self.thermal_zone = Some(path.into());
        self
    }

    /// Aggregate status as of the last iteration
    pub fn status_receiver(&self) -> watch::Receiver<SystemStatus> {
        self.status_tx.subscribe()
    }

    pub fn consecutive_failures(&self, handle: &DeviceHandle) -> u32 {
        self.tracker.consecutive_failures(handle)
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(period_secs = self.period.as_secs(), "Sampling loop started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            let report = self.run_iteration().await;
            trace!(?report, "Sampling iteration finished");

            if let Some(delay) = report.recovery_delay {
                debug!(delay_ms = delay.as_millis() as u64, "Waiting before next iteration");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                interval.reset();
            }
        }
        info!("Sampling loop stopped");
    }

    /// Sample every bound handle once
    pub async fn run_iteration(&mut self) -> IterationReport {
        let handles = self.monitor.current_handles();
        self.tracker.retain_current(&handles);

        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut first_failure = false;

        for handle in &handles {
            let Some(node) = self.nodes.get(&handle.kind).cloned() else {
                continue;
            };

            match self.read(handle).await {
                Ok(readings) => {
                    self.write_readings(&node, &readings);
                    let previous = self.tracker.record_success(handle);
                    if previous > 0 {
                        info!(identifier = %handle.identifier, previous, "Device recovered");
                    }
                    succeeded += 1;
                }
                Err(LinkError::StaleHandle { .. }) => {
                    debug!(identifier = %handle.identifier, "Skipping stale handle");
                    skipped += 1;
                }
                Err(e) => {
                    let count = self.tracker.record_failure(handle);
                    warn!(
                        identifier = %handle.identifier,
                        consecutive_failures = count,
                        "Failed to read device: {}",
                        e
                    );
                    first_failure |= count == 1;
                    failed += 1;
                }
            }
        }

        let status = self.tracker.evaluate();
        let status_changed = self.status != Some(status);
        if status_changed {
            self.publish_status(status);
        }

        self.refresh_system_properties().await;

        IterationReport {
            succeeded,
            failed,
            skipped,
            status,
            status_changed,
            recovery_delay: first_failure.then_some(self.recovery_delay),
        }
    }

    async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError> {
        match tokio::time::timeout(self.read_timeout, self.monitor.read(handle)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ReadTimeout {
                identifier: handle.identifier.clone(),
                timeout_ms: self.read_timeout.as_millis() as u64,
            }),
        }
    }

    async fn refresh_system_properties(&self) {
        let uptime_hours = self.started.elapsed().as_secs_f64() / 3600.0;
        if let Err(e) = self.registry.set(UPTIME_PROPERTY, uptime_hours) {
            warn!("Failed to update uptime: {}", e);
        }

        let address = ip_address_text();
        match self.registry.set(IP_ADDRESS_PROPERTY, address.as_str()) {
            Ok(true) => info!(%address, "IP address changed"),
            Ok(false) => {}
            Err(e) => warn!("Failed to update IP address: {}", e),
        }

        let Some(path) = &self.thermal_zone else {
            return;
        };
        let celsius = match tokio::fs::read_to_string(path).await {
            Ok(raw) => parse_thermal_millidegrees(&raw),
            Err(e) => {
                debug!(path = %path.display(), "Failed to read thermal zone: {}", e);
                return;
            }
        };
        match celsius {
            Some(celsius) => {
                if let Err(e) = self.registry.set(CPU_TEMPERATURE_PROPERTY, celsius) {
                    warn!("Failed to update CPU temperature: {}", e);
                }
            }
            None => debug!(path = %path.display(), "Unparseable thermal zone reading"),
        }
    }

    fn write_readings(&mut self, node: &str, readings: &[Reading]) {
        for reading in readings {
            let name = property_name(node, reading.channel);
            let value = self.smoother.apply(&name, reading.value);
            if let Err(e) = self.registry.set(&name, value) {
                warn!(property = %name, "Dropping reading: {}", e);
            }
        }
    }

    fn publish_status(&mut self, status: SystemStatus) {
        match status {
            SystemStatus::Healthy => info!("System status is healthy"),
            SystemStatus::Alert => warn!(
                threshold = self.tracker.threshold(),
                "System status is alert"
            ),
        }

        let message = match status {
            SystemStatus::Healthy => HEALTHY_MESSAGE,
            SystemStatus::Alert => self.alert_message.as_str(),
        };
        if let Err(e) = self.registry.set(STATUS_PROPERTY, message) {
            warn!("Failed to update status: {}", e);
        }
        if let Err(e) = self.registry.set(STATE_ATTRIBUTE, status.device_state()) {
            warn!("Failed to update device state: {}", e);
        }

        self.status = Some(status);
        self.status_tx.send_replace(status);
    }
}
