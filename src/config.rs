//! Daemon configuration
//!
//! Configuration is read from a TOML file, then selected values are overridden
//! from the environment (`MQTT_BROKER_URL`, `LINK_HOST`). Secrets are never
//! stored in the file; the file names the environment variable that holds them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding `mqtt.broker_url`
pub const BROKER_URL_ENV: &str = "MQTT_BROKER_URL";
/// Environment variable overriding `link.host`
pub const LINK_HOST_ENV: &str = "LINK_HOST";

/// Node name reserved for the daemon's own status properties
pub const SYSTEM_NODE: &str = "system";

/// Locations searched when no config path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["telemetry.toml", "/etc/homie-telemetry/telemetry.toml"];

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub sensors: Vec<SensorSection>,
    /// Time-series mirror (optional)
    pub sink: Option<SinkSection>,
    /// HTTP health endpoint (optional)
    pub health: Option<HealthSection>,
    /// Extra log outputs besides stdout
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Device identity on the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Topic-safe identifier (must match [a-z0-9-]+)
    pub id: String,
    /// Human readable name announced as `$name`
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Topic prefix (default: homie)
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Time allowed between opening a connection and the ConnAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_base_topic() -> String {
    "homie".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

/// Broker reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor per attempt; 1.0 gives a fixed delay
    pub multiplier: f64,
    /// Fraction of the delay randomised in both directions, 0.0..=1.0
    pub jitter: f64,
    /// Give up after this many attempts (unset = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

/// Which device link implementation to run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Tinkerforge,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkSection {
    pub kind: LinkKind,
    pub host: String,
    pub port: u16,
    /// Upper bound for a single device read
    pub read_timeout_ms: u64,
    /// Wait between hardware link reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Probability that a simulated read fails
    pub failure_rate: f64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            kind: LinkKind::Tinkerforge,
            host: "localhost".to_string(),
            port: 4223,
            read_timeout_ms: 2000,
            reconnect_delay_ms: 5000,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingSection {
    pub period_secs: u64,
    /// Alert once a handle fails more than this many times in a row
    pub failure_threshold: u32,
    /// Extra wait after the first failure of a handle
    pub recovery_delay_ms: u64,
    /// Moving average window; 1 publishes raw readings
    pub smoothing_window: usize,
    /// `system/status` text while alerting
    pub alert_message: String,
    /// Publish `system/cpu-temperature` from the kernel thermal zone
    pub cpu_temperature: bool,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            period_secs: 5,
            failure_threshold: 3,
            recovery_delay_ms: 2000,
            smoothing_window: 1,
            alert_message: "Bricklet is missing!".to_string(),
            cpu_temperature: false,
        }
    }
}

/// Sensor families with a reader
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    AirQuality,
    SimulatedEnvironment,
}

/// Maps one sensor kind onto a Homie node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSection {
    pub kind: SensorKind,
    pub node: String,
    #[serde(default)]
    pub node_name: Option<String>,
}

impl SensorSection {
    pub fn display_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or(&self.node)
    }
}

/// InfluxDB v2 mirror
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkSection {
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// Environment variable containing the API token
    pub token_env: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_sink_interval")]
    pub interval_secs: u64,
    /// Property names to mirror (empty = every numeric sensor property)
    #[serde(default)]
    pub properties: Vec<String>,
}

fn default_measurement() -> String {
    "AirQuality".to_string()
}

fn default_sink_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    pub port: u16,
}

/// Additional log destinations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Append plain-text log lines to this file
    pub file: Option<PathBuf>,
    /// Forward log events to `<mqtt_topic>/<logger>/<level>`, QoS 0, not retained
    pub mqtt_topic: Option<String>,
    /// Least severe level forwarded to the broker
    pub mqtt_level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: None,
            mqtt_topic: None,
            mqtt_level: "info".to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No configuration file found in {0:?}")]
    NotFound(Vec<String>),
}

impl TelemetryConfig {
    /// Load, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// First existing file among [`DEFAULT_CONFIG_PATHS`]
    pub fn find_config_file() -> Result<PathBuf, ConfigError> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .ok_or_else(|| {
                ConfigError::NotFound(DEFAULT_CONFIG_PATHS.iter().map(|p| p.to_string()).collect())
            })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(BROKER_URL_ENV) {
            self.mqtt.broker_url = url;
        }
        if let Some(host) = non_empty_env(LINK_HOST_ENV) {
            self.link.host = host;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.device.id)?;

        if self.sensors.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[sensors]] entry is required".to_string(),
            ));
        }

        let mut nodes = std::collections::HashSet::new();
        for sensor in &self.sensors {
            validate_id(&sensor.node)?;
            if sensor.node == SYSTEM_NODE {
                return Err(ConfigError::InvalidConfig(format!(
                    "node '{SYSTEM_NODE}' is reserved"
                )));
            }
            if !nodes.insert(sensor.node.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "node '{}' is declared twice",
                    sensor.node
                )));
            }
        }

        if self.sampling.period_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "sampling.period_secs must be greater than 0".to_string(),
            ));
        }
        if self.sampling.smoothing_window == 0 {
            return Err(ConfigError::InvalidConfig(
                "sampling.smoothing_window must be at least 1".to_string(),
            ));
        }
        if self.link.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "link.read_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.link.failure_rate) {
            return Err(ConfigError::InvalidConfig(
                "link.failure_rate must be within 0.0..=1.0".to_string(),
            ));
        }

        let reconnect = &self.mqtt.reconnect;
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms"
                    .to_string(),
            ));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or unset".to_string(),
            ));
        }

        if let Some(topic) = &self.logging.mqtt_topic {
            let wildcard = topic.contains(|c| c == '+' || c == '#');
            if topic.is_empty() || wildcard || topic.ends_with('/') {
                return Err(ConfigError::InvalidConfig(format!(
                    "logging.mqtt_topic '{topic}' must be a non-empty topic without wildcards"
                )));
            }
        }

        if let Some(sink) = &self.sink {
            url::Url::parse(&sink.url)
                .map_err(|e| ConfigError::InvalidConfig(format!("sink.url: {e}")))?;
            if sink.interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "sink.interval_secs must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// InfluxDB token; only called when a sink is configured
    pub fn get_sink_token(&self) -> Result<Option<String>, ConfigError> {
        self.sink
            .as_ref()
            .map(|sink| Self::get_env_var_required(&sink.token_env))
            .transpose()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "air-monitor"
name = "Air Monitor"

[mqtt]
broker_url = "mqtt://localhost:1883"

[link]
kind = "simulated"

[[sensors]]
kind = "air-quality"
node = "ambient"
node_name = "Ambient"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Validate a topic-level identifier (device or node id)
pub fn validate_id(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if id.is_empty() || !valid_chars || id.starts_with('-') {
        return Err(ConfigError::InvalidId(format!(
            "'{id}' must match pattern [a-z0-9-]+"
        )));
    }

    Ok(())
}
