//! In-process link producing plausible environment readings
//!
//! Useful for running the daemon without hardware. Reads fail at the
//! configured rate so the failure tracking path can be exercised.

use super::{DeviceHandle, DeviceKind, DeviceLink, LinkError, LinkEvent, Reading};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of the single simulated device
pub const SIMULATED_DEVICE_UID: &str = "sim-env";

pub struct SimulatedLink {
    failure_rate: f64,
    rng: Mutex<StdRng>,
    events: tokio::sync::Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl SimulatedLink {
    pub fn new(failure_rate: f64) -> Self {
        Self::with_rng(failure_rate, StdRng::from_entropy())
    }

    /// Deterministic readings for tests
    pub fn with_seed(failure_rate: f64, seed: u64) -> Self {
        Self::with_rng(failure_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(failure_rate: f64, rng: StdRng) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
            events: tokio::sync::Mutex::new(None),
        }
    }

    async fn emit(&self, event: LinkEvent) -> Result<(), LinkError> {
        let events = self.events.lock().await;
        let sender = events.as_ref().ok_or(LinkError::NotConnected)?;
        sender
            .send(event)
            .await
            .map_err(|_| LinkError::NotConnected)
    }
}

#[async_trait::async_trait]
impl DeviceLink for SimulatedLink {
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        *self.events.lock().await = Some(events);
        self.emit(LinkEvent::LinkReconnected { at: Utc::now() }).await
    }

    async fn enumerate(&self) -> Result<(), LinkError> {
        self.emit(LinkEvent::DeviceAvailable {
            identifier: SIMULATED_DEVICE_UID.to_string(),
            kind: DeviceKind::SimulatedEnvironment,
        })
        .await
    }

    async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError> {
        if handle.kind != DeviceKind::SimulatedEnvironment {
            return Err(LinkError::UnsupportedKind {
                identifier: handle.identifier.clone(),
                kind: handle.kind,
            });
        }

        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate) {
            debug!(identifier = %handle.identifier, "Simulated read failure");
            return Err(LinkError::ReadFailed("simulated failure".to_string()));
        }

        Ok(vec![
            Reading::new("temperature", 20.0 + rng.gen::<f64>() * 3.0),
            Reading::new("humidity", 50.0 + rng.gen::<f64>() * 3.0),
            Reading::new("pressure", 999.0 + rng.gen::<f64>() * 20.0),
        ])
    }

    async fn stop(&self) {
        self.events.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DeviceHandle {
        DeviceHandle {
            identifier: SIMULATED_DEVICE_UID.to_string(),
            kind: DeviceKind::SimulatedEnvironment,
            bound_at: 1,
        }
    }

    #[tokio::test]
    async fn test_start_reports_connection_and_enumerate_announces_device() {
        let link = SimulatedLink::with_seed(0.0, 1);
        let (tx, mut rx) = mpsc::channel(4);

        link.start(tx).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::LinkReconnected { .. })
        ));

        link.enumerate().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::DeviceAvailable {
                identifier: SIMULATED_DEVICE_UID.to_string(),
                kind: DeviceKind::SimulatedEnvironment,
            })
        );
    }

    #[tokio::test]
    async fn test_readings_within_ranges() {
        let link = SimulatedLink::with_seed(0.0, 42);
        for _ in 0..20 {
            let readings = link.read(&handle()).await.unwrap();
            assert_eq!(readings.len(), 3);
            assert!((20.0..23.0).contains(&readings[0].value));
            assert!((50.0..53.0).contains(&readings[1].value));
            assert!((999.0..1019.0).contains(&readings[2].value));
        }
    }

    #[tokio::test]
    async fn test_failure_rate_one_always_fails() {
        let link = SimulatedLink::with_seed(1.0, 7);
        assert!(matches!(
            link.read(&handle()).await,
            Err(LinkError::ReadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_enumerate_before_start_fails() {
        let link = SimulatedLink::new(0.0);
        assert!(matches!(link.enumerate().await, Err(LinkError::NotConnected)));
    }
}
