//! Retained state replay across broker generations
//!
//! A reconnecting session must bring a broker that lost every retained
//! message back to the exact state held by the registry.

mod test_helpers;

use homie_telemetry::registry::PropertyValue;
use homie_telemetry::testing::MockSink;
use homie_telemetry::transport::mqtt::SyncOutcome;
use homie_telemetry::ConnectionState;
use test_helpers::{declared_registry, publisher};

const TEMPERATURE_TOPIC: &str = "homie/air-monitor/ambient/temperature";

#[tokio::test]
async fn test_value_replayed_verbatim_after_reconnect() {
    // Arrange: first session replays, then a value is sampled
    let registry = declared_registry();
    let mut publisher = publisher(registry.clone());
    let sink = MockSink::new();

    publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await
        .unwrap();
    registry.set("ambient/temperature", 21.5).unwrap();
    publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await
        .unwrap();
    assert_eq!(sink.payloads_for(TEMPERATURE_TOPIC), vec!["0.00", "21.50"]);

    // Act: the broker restarts with no retained state
    let second = MockSink::new();
    publisher
        .sync(&second, &ConnectionState::Disconnected("broker restart".to_string()))
        .await
        .unwrap();
    let outcome = publisher
        .sync(&second, &ConnectionState::Connected { generation: 2 })
        .await
        .unwrap();

    // Assert: the value is replayed without a new sample
    assert!(matches!(outcome, SyncOutcome::Replayed { generation: 2, .. }));
    assert_eq!(second.payloads_for(TEMPERATURE_TOPIC), vec!["21.50"]);
    assert!(second.published().iter().all(|message| message.retain));
}

#[tokio::test]
async fn test_metadata_precedes_values() {
    let registry = declared_registry();
    let mut publisher = publisher(registry);
    let sink = MockSink::new();

    publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await
        .unwrap();

    let topics: Vec<String> = sink.published().into_iter().map(|m| m.topic).collect();
    let position = |topic: &str| topics.iter().position(|t| t == topic).unwrap();
    assert_eq!(topics[0], "homie/air-monitor/$homie");
    assert!(position("homie/air-monitor/$nodes") < position("homie/air-monitor/$state"));
    assert!(position("homie/air-monitor/ambient/$name") < position(TEMPERATURE_TOPIC));
    assert_eq!(
        sink.payloads_for("homie/air-monitor/$nodes"),
        vec!["ambient,system"]
    );
}

#[tokio::test]
async fn test_changes_while_disconnected_are_not_replayed_twice() {
    let registry = declared_registry();
    let mut publisher = publisher(registry.clone());
    let sink = MockSink::new();

    publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await
        .unwrap();

    registry.set("ambient/humidity", 40.0).unwrap();
    let outcome = publisher
        .sync(&sink, &ConnectionState::Connecting)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Discarded(1));

    sink.clear();
    publisher
        .sync(&sink, &ConnectionState::Connected { generation: 2 })
        .await
        .unwrap();
    let outcome = publisher
        .sync(&sink, &ConnectionState::Connected { generation: 2 })
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Deltas(0));
    assert_eq!(
        sink.payloads_for("homie/air-monitor/ambient/humidity"),
        vec!["40.00"]
    );
    assert_eq!(
        registry.get("ambient/humidity"),
        Some(PropertyValue::Number(40.0))
    );
}

#[tokio::test]
async fn test_failed_replay_is_retried() {
    let registry = declared_registry();
    let mut publisher = publisher(registry);
    let sink = MockSink::with_failure();

    let result = publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await;
    assert!(result.is_err());
    assert!(publisher.needs_replay(1));

    sink.set_should_fail(false);
    let outcome = publisher
        .sync(&sink, &ConnectionState::Connected { generation: 1 })
        .await
        .unwrap();
    assert!(matches!(outcome, SyncOutcome::Replayed { generation: 1, .. }));
}
