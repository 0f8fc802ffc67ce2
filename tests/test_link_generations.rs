//! Device handles across hardware link reconnects
//!
//! Handles carry the link generation they were bound in; after a reconnect
//! they must be rejected until enumeration binds fresh ones.

use chrono::Utc;
use homie_telemetry::link::simulated::SIMULATED_DEVICE_UID;
use homie_telemetry::link::{DeviceKind, LinkError, LinkEvent, LinkMonitor, SimulatedLink};
use homie_telemetry::testing::MockLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn reconnected() -> LinkEvent {
    LinkEvent::LinkReconnected { at: Utc::now() }
}

fn available(identifier: &str, kind: DeviceKind) -> LinkEvent {
    LinkEvent::DeviceAvailable {
        identifier: identifier.to_string(),
        kind,
    }
}

#[tokio::test]
async fn test_handle_from_previous_generation_is_rejected() {
    // Arrange
    let link = Arc::new(MockLink::new());
    let monitor = LinkMonitor::new(link.clone(), [DeviceKind::AirQuality]);
    monitor.handle_event(reconnected()).await.unwrap();
    monitor
        .handle_event(available("Lt1", DeviceKind::AirQuality))
        .await
        .unwrap();
    let old = monitor.current_handles().remove(0);

    // Act: the link drops and comes back
    monitor.handle_event(reconnected()).await.unwrap();

    // Assert: old handle is stale and never reaches the link
    let result = monitor.read(&old).await;
    assert!(matches!(
        result,
        Err(LinkError::StaleHandle { bound_at: 1, current: 2, .. })
    ));
    assert_eq!(link.read_calls(), 0);
    assert!(monitor.current_handles().is_empty());
    assert_eq!(link.enumerate_calls(), 2);

    monitor
        .handle_event(available("Lt1", DeviceKind::AirQuality))
        .await
        .unwrap();
    let fresh = monitor.current_handles().remove(0);
    assert_eq!(fresh.bound_at, 2);
    assert!(monitor.read(&fresh).await.is_ok());
}

#[tokio::test]
async fn test_devices_without_node_or_reader_are_ignored() {
    let link = Arc::new(MockLink::new());
    let monitor = LinkMonitor::new(link, [DeviceKind::AirQuality]);
    monitor.handle_event(reconnected()).await.unwrap();

    monitor
        .handle_event(available("Sd1", DeviceKind::SegmentDisplay))
        .await
        .unwrap();
    monitor
        .handle_event(available("sim", DeviceKind::SimulatedEnvironment))
        .await
        .unwrap();
    monitor
        .handle_event(available("X1", DeviceKind::Other(9999)))
        .await
        .unwrap();

    assert!(monitor.current_handles().is_empty());
}

#[tokio::test]
async fn test_simulated_link_binds_through_monitor() {
    let link = Arc::new(SimulatedLink::with_seed(0.0, 7));
    let monitor = Arc::new(LinkMonitor::new(link, [DeviceKind::SimulatedEnvironment]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut generation_rx = monitor.generation_receiver();

    let task = monitor
        .start(shutdown_rx, tracing::info_span!("test_link"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), generation_rx.wait_for(|g| *g >= 1))
        .await
        .expect("link should connect")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while monitor.current_handles().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("simulated device should be bound");

    let handle = monitor.current_handles().remove(0);
    assert_eq!(handle.identifier, SIMULATED_DEVICE_UID);
    let readings = monitor.read(&handle).await.unwrap();
    assert_eq!(readings.len(), 3);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor should stop")
        .unwrap();
    monitor.stop().await;
    assert!(monitor.current_handles().is_empty());
}
