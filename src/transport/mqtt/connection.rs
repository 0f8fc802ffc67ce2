//! Pure connection state management for the broker session
//!
//! This module contains pure functions for connection state management,
//! backoff calculation, option building and topic construction.

use crate::config::{MqttSection, ReconnectSection};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// `$state` payload the broker publishes on our behalf when the link drops
pub const LOST_STATE: &str = "lost";

/// Device-level attribute carrying the Homie lifecycle state
pub const STATE_ATTRIBUTE: &str = "$state";

/// Connection state of the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No usable connection, with the reason
    Disconnected(String),
    /// Connection opened, waiting for ConnAck
    Connecting,
    /// ConnAck received; `generation` counts successful connections
    Connected { generation: u64 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            ConnectionState::Connected { generation } => Some(*generation),
            _ => None,
        }
    }

    /// Short label for logs and the health endpoint
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
        }
    }
}

/// Reconnection backoff: capped exponential with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomised in both directions
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier: section.multiplier,
            jitter: section.jitter,
            max_attempts: section.max_attempts,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay before `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if delay.is_finite() {
            (delay as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        }
    }

    /// Spread `delay_ms` by `sample` in -1.0..=1.0 scaled by the jitter fraction
    pub fn apply_jitter(&self, delay_ms: u64, sample: f64) -> u64 {
        let spread = delay_ms as f64 * self.jitter * sample.clamp(-1.0, 1.0);
        let jittered = (delay_ms as f64 + spread).max(0.0) as u64;
        jittered.min(self.max_delay_ms)
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Session already started")]
    AlreadyStarted,
}

/// Build broker options, including credentials and the `$state=lost` last will
pub fn configure_mqtt_options(
    device_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Fresh client id per connection attempt so a half-dead session never collides
    let client_id = format!("{device_id}-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    let topics = TopicBuilder::new(&config.base_topic, device_id);
    let lwt = LastWill::new(
        topics.state_topic(),
        LOST_STATE,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

/// Homie topic construction: `<base>/<device>/<name>`
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    root: String,
}

impl TopicBuilder {
    pub fn new(base_topic: &str, device_id: &str) -> Self {
        let base = base_topic.trim_matches('/');
        Self {
            root: format!("{base}/{device_id}"),
        }
    }

    /// `<base>/<device>`
    pub fn device_root(&self) -> &str {
        &self.root
    }

    /// Topic for a registry name such as `ambient/temperature` or `$state`
    pub fn property_topic(&self, name: &str) -> String {
        format!("{}/{}", self.root, name.trim_start_matches('/'))
    }

    pub fn state_topic(&self) -> String {
        self.property_topic(STATE_ATTRIBUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            base_topic: "homie".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            reconnect: ReconnectSection::default(),
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_calculate_backoff_delay_exponential_and_capped() {
        let config = ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        };

        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert_eq!(config.calculate_backoff_delay(2), 200);
        assert_eq!(config.calculate_backoff_delay(4), 800);
        assert_eq!(config.calculate_backoff_delay(5), 1000);
        assert_eq!(config.calculate_backoff_delay(500), 1000);
    }

    #[test]
    fn test_multiplier_one_is_fixed_delay() {
        let config = ReconnectConfig {
            initial_delay_ms: 2000,
            max_delay_ms: 2000,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        };
        assert_eq!(config.calculate_backoff_delay(1), 2000);
        assert_eq!(config.calculate_backoff_delay(9), 2000);
    }

    #[test]
    fn test_apply_jitter_bounds() {
        let config = ReconnectConfig {
            jitter: 0.5,
            ..ReconnectConfig::default()
        };
        assert_eq!(config.apply_jitter(1000, 0.0), 1000);
        assert_eq!(config.apply_jitter(1000, -1.0), 500);
        assert_eq!(config.apply_jitter(1000, 1.0), 1500);
        assert_eq!(config.apply_jitter(1000, 7.0), 1500);
        assert_eq!(config.apply_jitter(29_000, 1.0), 30_000);
    }

    #[test]
    fn test_topic_construction() {
        let topics = TopicBuilder::new("homie", "air-monitor");
        assert_eq!(topics.device_root(), "homie/air-monitor");
        assert_eq!(
            topics.property_topic("ambient/temperature"),
            "homie/air-monitor/ambient/temperature"
        );
        assert_eq!(topics.state_topic(), "homie/air-monitor/$state");

        let trimmed = TopicBuilder::new("/homie/", "air-monitor");
        assert_eq!(trimmed.device_root(), "homie/air-monitor");
    }

    #[test]
    fn test_connection_state_helpers() {
        let connected = ConnectionState::Connected { generation: 3 };
        assert!(connected.is_connected());
        assert_eq!(connected.generation(), Some(3));
        assert_eq!(connected.label(), "connected");
        assert_eq!(ConnectionState::Connecting.generation(), None);
        assert!(!ConnectionState::Disconnected("x".into()).is_connected());
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let options = configure_mqtt_options("air-monitor", &config).unwrap();
        assert!(options.client_id().starts_with("air-monitor-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();

        let result = configure_mqtt_options("air-monitor", &config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }
}
