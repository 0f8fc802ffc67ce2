//! Integration tests for the InfluxDB mirror
//!
//! Tests behavioral contracts against a mock HTTP server:
//! - Write API path, query and token header
//! - Line protocol body built from sampled registry values
//! - Rejections surfaced as errors without stopping the mirror

mod test_helpers;

use homie_telemetry::config::SinkSection;
use homie_telemetry::sink::{InfluxWriter, MirrorLoop, Point, PointWriter, SinkError};
use std::sync::Arc;
use test_helpers::declared_registry;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sink_section(url: &str) -> SinkSection {
    SinkSection {
        url: url.to_string(),
        org: "home".to_string(),
        bucket: "sensors".to_string(),
        token_env: "INFLUXDB_TOKEN".to_string(),
        measurement: "AirQuality".to_string(),
        interval_secs: 5,
        properties: Vec::new(),
    }
}

#[tokio::test]
async fn test_mirror_writes_sampled_values() {
    // Arrange
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .and(query_param("org", "home"))
        .and(query_param("bucket", "sensors"))
        .and(query_param("precision", "ns"))
        .and(header("Authorization", "Token t"))
        .and(body_string_contains("AirQuality,device=air-monitor"))
        .and(body_string_contains("Temperature=21.5"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let section = sink_section(&mock_server.uri());
    let writer = Arc::new(InfluxWriter::new(&section, Some("t".to_string())).unwrap());
    let registry = declared_registry();
    let mirror = MirrorLoop::new(registry.clone(), writer, &section, "air-monitor");

    // Act
    registry.set("ambient/temperature", 21.5).unwrap();
    let written = mirror.run_once().await.unwrap();

    // Assert: only the sampled property is present
    assert!(written);
    let requests = mock_server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(!body.contains("Humidity="));
}

#[tokio::test]
async fn test_mirror_skips_write_before_first_sample() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;

    let section = sink_section(&mock_server.uri());
    let writer = Arc::new(InfluxWriter::new(&section, None).unwrap());
    let mirror = MirrorLoop::new(declared_registry(), writer, &section, "air-monitor");

    assert!(!mirror.run_once().await.unwrap());
}

#[tokio::test]
async fn test_writer_reports_rejection() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized access"))
        .mount(&mock_server)
        .await;

    let section = sink_section(&mock_server.uri());
    let writer = InfluxWriter::new(&section, Some("wrong".to_string())).unwrap();
    let point = Point::new("AirQuality", chrono::Utc::now()).field("Temperature", 20.0);

    let result = writer.write(&[point]).await;

    match result {
        Err(SinkError::Rejected { status, body }) => {
            assert_eq!(status, 401);
            assert_eq!(body, "unauthorized access");
        }
        other => panic!("Expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_http_error() {
    let section = sink_section("http://127.0.0.1:1");
    let writer = InfluxWriter::new(&section, None).unwrap();
    let point = Point::new("AirQuality", chrono::Utc::now()).field("Temperature", 20.0);

    let result = writer.write(&[point]).await;

    assert!(matches!(result, Err(SinkError::Http(_))));
}

#[tokio::test]
async fn test_write_under_path_prefix() {
    // Arrange: InfluxDB served behind a reverse proxy prefix
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/influx/api/v2/write"))
        .and(query_param("bucket", "sensors"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let section = sink_section(&format!("{}/influx", mock_server.uri()));
    let writer = InfluxWriter::new(&section, None).unwrap();
    let point = Point::new("AirQuality", chrono::Utc::now()).field("Temperature", 20.0);

    // Act
    let result = writer.write(&[point]).await;

    // Assert
    assert!(result.is_ok(), "Expected write under prefix, got {result:?}");
}
