//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use homie_telemetry::config::{ConfigError, LinkKind, SensorKind, TelemetryConfig, BROKER_URL_ENV};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[link]
kind = "tinkerforge"
host = "brickd.local"

[[sensors]]
kind = "air-quality"
node = "ambient"
node_name = "Ambient"
"#,
    );

    let config = TelemetryConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.id, "air-monitor");
    assert_eq!(config.device.name, "Air Monitor");
    assert_eq!(config.link.kind, LinkKind::Tinkerforge);
    assert_eq!(config.link.port, 4223);
    assert_eq!(config.sensors[0].kind, SensorKind::AirQuality);
    assert_eq!(config.sensors[0].display_name(), "Ambient");
    assert_eq!(config.sampling.failure_threshold, 3);
}

#[test]
fn test_config_loads_with_sink_and_health() {
    let temp_file = write_config(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtts://broker.local:8883"

[[sensors]]
kind = "simulated-environment"
node = "lab"

[sink]
url = "http://influx.local:8086"
org = "home"
bucket = "sensors"
token_env = "INFLUXDB_TOKEN"
properties = ["lab/temperature"]

[health]
port = 9090
"#,
    );

    let config = TelemetryConfig::load_from_file(temp_file.path()).unwrap();

    let sink = config.sink.unwrap();
    assert_eq!(sink.bucket, "sensors");
    assert_eq!(sink.properties, vec!["lab/temperature"]);
    assert_eq!(config.health.unwrap().port, 9090);
}

#[test]
fn test_config_returns_error_when_device_section_missing() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[[sensors]]
kind = "air-quality"
node = "ambient"
"#,
    );

    let result = TelemetryConfig::load_from_file(temp_file.path());

    match result {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error for missing device section, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_invalid_device_id() {
    let temp_file = write_config(
        r#"
[device]
id = "Air Monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[sensors]]
kind = "air-quality"
node = "ambient"
"#,
    );

    let result = TelemetryConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidId(_))));
}

#[test]
fn test_config_rejects_unknown_sensor_kind() {
    let temp_file = write_config(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[sensors]]
kind = "segment-display"
node = "display"
"#,
    );

    let result = TelemetryConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_when_file_missing() {
    let result =
        TelemetryConfig::load_from_file(std::path::Path::new("/nonexistent/telemetry.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_broker_url_overridden_from_environment() {
    let temp_file = write_config(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[sensors]]
kind = "air-quality"
node = "ambient"
"#,
    );

    std::env::set_var(BROKER_URL_ENV, "mqtt://override.local:1883");
    let result = TelemetryConfig::load_from_file(temp_file.path());
    std::env::remove_var(BROKER_URL_ENV);

    assert_eq!(result.unwrap().mqtt.broker_url, "mqtt://override.local:1883");
}

#[test]
fn test_config_round_trips_through_show() {
    let temp_file = write_config(
        r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[sensors]]
kind = "air-quality"
node = "ambient"
"#,
    );
    let config = TelemetryConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = TelemetryConfig::from_toml(&rendered).unwrap();

    assert_eq!(reparsed.sensors, config.sensors);
    assert_eq!(reparsed.sampling, config.sampling);
}
