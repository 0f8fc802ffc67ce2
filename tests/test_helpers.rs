//! Test helpers and utilities for integration tests

use homie_telemetry::config::TelemetryConfig;
use homie_telemetry::registry::PropertyRegistry;
use homie_telemetry::sampling::declare_properties;
use homie_telemetry::transport::mqtt::{StatePublisher, TopicBuilder};
use std::sync::Arc;

/// Configuration with one air-quality node and a simulated link
#[allow(dead_code)]
pub fn test_config() -> TelemetryConfig {
    TelemetryConfig::from_toml(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://127.0.0.1:1"

[mqtt.reconnect]
initial_delay_ms = 50
max_delay_ms = 200

[link]
kind = "simulated"
read_timeout_ms = 200

[sampling]
period_secs = 1
failure_threshold = 3
recovery_delay_ms = 10

[[sensors]]
kind = "air-quality"
node = "ambient"
node_name = "Ambient"
"#,
    )
    .expect("Test config should parse")
}

/// Registry with the full schema declared for [`test_config`]
#[allow(dead_code)]
pub fn declared_registry() -> Arc<PropertyRegistry> {
    let registry = Arc::new(PropertyRegistry::new());
    declare_properties(&registry, &test_config()).expect("Schema should declare");
    registry
}

/// Publisher for `homie/air-monitor`
#[allow(dead_code)]
pub fn publisher(registry: Arc<PropertyRegistry>) -> StatePublisher {
    StatePublisher::new(
        registry,
        TopicBuilder::new("homie", "air-monitor"),
        "Air Monitor",
    )
    .with_node_name("ambient", "Ambient")
}
