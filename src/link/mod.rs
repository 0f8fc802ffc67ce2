//! Device links: transport to physical sensor hardware
//!
//! A [`DeviceLink`] reports attach and reconnect events over a channel and
//! reads bound devices on request. [`LinkMonitor`] owns the link, tracks the
//! link generation and hands out [`DeviceHandle`]s tagged with it.

pub mod monitor;
pub mod simulated;
pub mod tinkerforge;

pub use monitor::LinkMonitor;
pub use simulated::SimulatedLink;
pub use tinkerforge::TinkerforgeLink;

use crate::config::SensorKind;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Tinkerforge device identifier of the Air Quality Bricklet
pub const AIR_QUALITY_DEVICE_ID: u16 = 297;
/// Tinkerforge device identifier of the Segment Display 4x7 Bricklet
pub const SEGMENT_DISPLAY_DEVICE_ID: u16 = 237;
/// Identifier the simulated link reports for its environment sensor
pub const SIMULATED_ENVIRONMENT_DEVICE_ID: u16 = 0xFFFF;

/// One value channel of a sensor kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub unit: Option<&'static str>,
    pub precision: Option<u8>,
}

const AIR_QUALITY_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec {
        id: "pressure",
        display_name: "Pressure",
        unit: Some("hPa"),
        precision: Some(2),
    },
    ChannelSpec {
        id: "temperature",
        display_name: "Temperature",
        unit: Some("°C"),
        precision: Some(2),
    },
    ChannelSpec {
        id: "humidity",
        display_name: "Humidity",
        unit: Some("%"),
        precision: Some(2),
    },
    ChannelSpec {
        id: "quality-index",
        display_name: "Quality index",
        unit: None,
        precision: Some(0),
    },
];

const SIMULATED_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec {
        id: "temperature",
        display_name: "Temperature",
        unit: Some("°C"),
        precision: Some(2),
    },
    ChannelSpec {
        id: "humidity",
        display_name: "Humidity",
        unit: Some("%"),
        precision: Some(2),
    },
    ChannelSpec {
        id: "pressure",
        display_name: "Pressure",
        unit: Some("hPa"),
        precision: Some(2),
    },
];

/// Sensor type as reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    AirQuality,
    SegmentDisplay,
    SimulatedEnvironment,
    Other(u16),
}

impl DeviceKind {
    pub fn from_device_identifier(identifier: u16) -> Self {
        match identifier {
            AIR_QUALITY_DEVICE_ID => DeviceKind::AirQuality,
            SEGMENT_DISPLAY_DEVICE_ID => DeviceKind::SegmentDisplay,
            SIMULATED_ENVIRONMENT_DEVICE_ID => DeviceKind::SimulatedEnvironment,
            other => DeviceKind::Other(other),
        }
    }

    pub fn device_identifier(&self) -> u16 {
        match self {
            DeviceKind::AirQuality => AIR_QUALITY_DEVICE_ID,
            DeviceKind::SegmentDisplay => SEGMENT_DISPLAY_DEVICE_ID,
            DeviceKind::SimulatedEnvironment => SIMULATED_ENVIRONMENT_DEVICE_ID,
            DeviceKind::Other(identifier) => *identifier,
        }
    }

    /// Whether this crate can read values from the kind
    pub fn has_reader(&self) -> bool {
        !self.channels().is_empty()
    }

    /// Value channels produced by a read, in publish order
    pub fn channels(&self) -> &'static [ChannelSpec] {
        match self {
            DeviceKind::AirQuality => AIR_QUALITY_CHANNELS,
            DeviceKind::SimulatedEnvironment => SIMULATED_CHANNELS,
            DeviceKind::SegmentDisplay | DeviceKind::Other(_) => &[],
        }
    }

    pub fn sensor_kind(&self) -> Option<SensorKind> {
        match self {
            DeviceKind::AirQuality => Some(SensorKind::AirQuality),
            DeviceKind::SimulatedEnvironment => Some(SensorKind::SimulatedEnvironment),
            DeviceKind::SegmentDisplay | DeviceKind::Other(_) => None,
        }
    }
}

impl From<SensorKind> for DeviceKind {
    fn from(kind: SensorKind) -> Self {
        match kind {
            SensorKind::AirQuality => DeviceKind::AirQuality,
            SensorKind::SimulatedEnvironment => DeviceKind::SimulatedEnvironment,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::AirQuality => f.write_str("air-quality"),
            DeviceKind::SegmentDisplay => f.write_str("segment-display"),
            DeviceKind::SimulatedEnvironment => f.write_str("simulated-environment"),
            DeviceKind::Other(identifier) => write!(f, "device-{identifier}"),
        }
    }
}

/// Live reference to a discovered device, valid for one link generation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub identifier: String,
    pub kind: DeviceKind,
    pub bound_at: u64,
}

/// One reading from a device channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub channel: &'static str,
    pub value: f64,
}

impl Reading {
    pub fn new(channel: &'static str, value: f64) -> Self {
        Self { channel, value }
    }
}

/// Events raised by a device link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    DeviceAvailable { identifier: String, kind: DeviceKind },
    /// Raised on every (re)connection, including the first
    LinkReconnected { at: DateTime<Utc> },
}

/// Binary protocol errors
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Packet too short: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("Invalid packet length {0}")]
    InvalidLength(u8),
    #[error("Invalid UID: {0}")]
    InvalidUid(String),
}

/// Device link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Link protocol error: {0}")]
    Codec(#[from] CodecError),
    #[error("Link is not connected")]
    NotConnected,
    #[error("Timed out waiting for {identifier} (function {function_id})")]
    Timeout { identifier: String, function_id: u8 },
    #[error("Read of {identifier} did not complete within {timeout_ms} ms")]
    ReadTimeout { identifier: String, timeout_ms: u64 },
    #[error("Device {identifier} reported error code {code}")]
    DeviceError { identifier: String, code: u8 },
    #[error("Handle for {identifier} is from generation {bound_at}, link is at {current}")]
    StaleHandle {
        identifier: String,
        bound_at: u64,
        current: u64,
    },
    #[error("No reader for device {identifier} of kind {kind}")]
    UnsupportedKind { identifier: String, kind: DeviceKind },
    #[error("Read failed: {0}")]
    ReadFailed(String),
}

/// Capability of a hardware link
///
/// Implementations emit [`LinkEvent`]s on the sender passed to `start` and
/// must raise `LinkReconnected` after each successful (re)connection.
#[async_trait::async_trait]
pub trait DeviceLink: Send + Sync {
    /// Begin connecting in the background
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError>;

    /// Ask the hardware to announce every attached device
    async fn enumerate(&self) -> Result<(), LinkError>;

    /// Read all channels of a device
    async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError>;

    /// Release the hardware
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_mapping() {
        assert_eq!(DeviceKind::from_device_identifier(297), DeviceKind::AirQuality);
        assert_eq!(
            DeviceKind::from_device_identifier(237),
            DeviceKind::SegmentDisplay
        );
        assert_eq!(DeviceKind::from_device_identifier(13), DeviceKind::Other(13));
        assert_eq!(DeviceKind::Other(13).device_identifier(), 13);
    }

    #[test]
    fn test_readers() {
        assert!(DeviceKind::AirQuality.has_reader());
        assert!(DeviceKind::SimulatedEnvironment.has_reader());
        assert!(!DeviceKind::SegmentDisplay.has_reader());
        assert!(!DeviceKind::Other(1).has_reader());

        let ids: Vec<&str> = DeviceKind::AirQuality.channels().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["pressure", "temperature", "humidity", "quality-index"]);
    }

    #[test]
    fn test_sensor_kind_round_trip() {
        for kind in [SensorKind::AirQuality, SensorKind::SimulatedEnvironment] {
            assert_eq!(DeviceKind::from(kind).sensor_kind(), Some(kind));
        }
        assert_eq!(DeviceKind::SegmentDisplay.sensor_kind(), None);
    }
}
