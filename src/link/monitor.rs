//! Hardware link monitor
//!
//! Owns the [`DeviceLink`], counts link generations and keeps the set of bound
//! handles. Every `LinkReconnected` event advances the generation, drops all
//! handles and re-runs enumeration; devices announced afterwards are bound
//! against the new generation.

use super::{DeviceHandle, DeviceKind, DeviceLink, LinkError, LinkEvent, Reading};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

/// Link events buffered between the link and the monitor task
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Default)]
struct MonitorState {
    generation: u64,
    handles: Vec<DeviceHandle>,
}

pub struct LinkMonitor {
    link: Arc<dyn DeviceLink>,
    wanted: HashSet<DeviceKind>,
    state: RwLock<MonitorState>,
    generation_tx: watch::Sender<u64>,
}

impl LinkMonitor {
    /// `wanted` lists the kinds that have a configured sensor node
    pub fn new(link: Arc<dyn DeviceLink>, wanted: impl IntoIterator<Item = DeviceKind>) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            link,
            wanted: wanted.into_iter().collect(),
            state: RwLock::new(MonitorState::default()),
            generation_tx,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MonitorState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MonitorState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the link and spawn the event dispatcher
    pub async fn start(
        self: &Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
        span: Span,
    ) -> Result<JoinHandle<()>, LinkError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        self.link.start(events_tx).await?;
        let monitor = Arc::clone(self);
        Ok(tokio::spawn(
            monitor.run(events_rx, shutdown_rx).instrument(span),
        ))
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Link monitor started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Link event channel closed");
                        break;
                    };
                    if let Err(e) = self.handle_event(event).await {
                        warn!("Failed to handle link event: {}", e);
                    }
                }
            }
        }
        info!("Link monitor stopped");
    }

    /// Apply one link event
    pub async fn handle_event(&self, event: LinkEvent) -> Result<(), LinkError> {
        match event {
            LinkEvent::LinkReconnected { at } => {
                let generation = {
                    let mut state = self.write_state();
                    state.generation += 1;
                    let dropped = state.handles.len();
                    state.handles.clear();
                    debug!(dropped, "Discarded handles of previous generation");
                    state.generation
                };
                self.generation_tx.send_replace(generation);
                info!(generation, connected_at = %at, "Device link (re)connected, enumerating");
                self.link.enumerate().await
            }
            LinkEvent::DeviceAvailable { identifier, kind } => {
                if !kind.has_reader() {
                    info!(identifier = %identifier, kind = %kind, "Ignoring device without reader");
                    return Ok(());
                }
                if !self.wanted.contains(&kind) {
                    info!(identifier = %identifier, kind = %kind, "Ignoring device with no configured node");
                    return Ok(());
                }
                let handle = self.bind(&identifier, kind)?;
                info!(identifier = %handle.identifier, kind = %kind, generation = handle.bound_at, "Bound device");
                Ok(())
            }
        }
    }

    /// Create a handle for a device in the current generation
    ///
    /// Rebinding an identifier replaces its previous handle.
    pub fn bind(&self, identifier: &str, kind: DeviceKind) -> Result<DeviceHandle, LinkError> {
        if !kind.has_reader() {
            return Err(LinkError::UnsupportedKind {
                identifier: identifier.to_string(),
                kind,
            });
        }

        let mut state = self.write_state();
        let handle = DeviceHandle {
            identifier: identifier.to_string(),
            kind,
            bound_at: state.generation,
        };
        state.handles.retain(|existing| existing.identifier != identifier);
        state.handles.push(handle.clone());
        Ok(handle)
    }

    pub fn current_handles(&self) -> Vec<DeviceHandle> {
        self.read_state().handles.clone()
    }

    pub fn generation(&self) -> u64 {
        self.read_state().generation
    }

    pub fn generation_receiver(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Whether `handle` belongs to the current generation and is still bound
    pub fn is_current(&self, handle: &DeviceHandle) -> bool {
        let state = self.read_state();
        handle.bound_at == state.generation && state.handles.contains(handle)
    }

    /// Read a device; stale handles are rejected without touching the link
    pub async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError> {
        if !self.is_current(handle) {
            return Err(LinkError::StaleHandle {
                identifier: handle.identifier.clone(),
                bound_at: handle.bound_at,
                current: self.generation(),
            });
        }
        self.link.read(handle).await
    }

    pub async fn stop(&self) {
        self.link.stop().await;
        self.write_state().handles.clear();
        info!("Device link released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockLink;
    use chrono::Utc;

    fn reconnected() -> LinkEvent {
        LinkEvent::LinkReconnected { at: Utc::now() }
    }

    fn available(identifier: &str, kind: DeviceKind) -> LinkEvent {
        LinkEvent::DeviceAvailable {
            identifier: identifier.to_string(),
            kind,
        }
    }

    fn monitor() -> (Arc<MockLink>, LinkMonitor) {
        let link = Arc::new(MockLink::new());
        let monitor = LinkMonitor::new(link.clone(), [DeviceKind::AirQuality]);
        (link, monitor)
    }

    #[tokio::test]
    async fn test_reconnect_advances_generation_and_enumerates() {
        let (link, monitor) = monitor();
        assert_eq!(monitor.generation(), 0);

        monitor.handle_event(reconnected()).await.unwrap();
        assert_eq!(monitor.generation(), 1);
        assert_eq!(link.enumerate_calls(), 1);
        assert_eq!(*monitor.generation_receiver().borrow(), 1);
    }

    #[tokio::test]
    async fn test_device_available_binds_current_generation() {
        let (_, monitor) = monitor();
        monitor.handle_event(reconnected()).await.unwrap();
        monitor
            .handle_event(available("Lt1", DeviceKind::AirQuality))
            .await
            .unwrap();

        let handles = monitor.current_handles();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].bound_at, 1);
        assert!(monitor.is_current(&handles[0]));
    }

    #[tokio::test]
    async fn test_unsupported_and_unwanted_devices_are_ignored() {
        let link = Arc::new(MockLink::new());
        let monitor = LinkMonitor::new(link, [DeviceKind::AirQuality]);
        monitor.handle_event(reconnected()).await.unwrap();

        monitor
            .handle_event(available("Seg", DeviceKind::SegmentDisplay))
            .await
            .unwrap();
        monitor
            .handle_event(available("Sim", DeviceKind::SimulatedEnvironment))
            .await
            .unwrap();
        assert!(monitor.current_handles().is_empty());
    }

    #[test]
    fn test_explicit_bind_of_unsupported_kind_fails() {
        let (_, monitor) = monitor();
        assert!(matches!(
            monitor.bind("Seg", DeviceKind::SegmentDisplay),
            Err(LinkError::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_handle_rejected_even_if_identifier_reappears() {
        let (link, monitor) = monitor();
        monitor.handle_event(reconnected()).await.unwrap();
        let old = monitor.bind("Lt1", DeviceKind::AirQuality).unwrap();

        monitor.handle_event(reconnected()).await.unwrap();
        let new = monitor.bind("Lt1", DeviceKind::AirQuality).unwrap();

        assert!(!monitor.is_current(&old));
        assert!(matches!(
            monitor.read(&old).await,
            Err(LinkError::StaleHandle {
                bound_at: 1,
                current: 2,
                ..
            })
        ));
        assert!(monitor.read(&new).await.is_ok());
        assert_eq!(link.read_calls(), 1);
    }

    #[tokio::test]
    async fn test_rebind_replaces_handle() {
        let (_, monitor) = monitor();
        monitor.bind("Lt1", DeviceKind::AirQuality).unwrap();
        monitor.bind("Lt1", DeviceKind::AirQuality).unwrap();
        assert_eq!(monitor.current_handles().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_processes_events_until_shutdown() {
        let (link, monitor) = monitor();
        let monitor = Arc::new(monitor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = monitor.start(shutdown_rx, Span::none()).await.unwrap();
        link.emit(reconnected()).await;
        link.emit(available("Lt1", DeviceKind::AirQuality)).await;

        let mut generation_rx = monitor.generation_receiver();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while monitor.current_handles().is_empty() {
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(20),
                    generation_rx.changed(),
                )
                .await;
            }
        })
        .await
        .expect("device should be bound");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
