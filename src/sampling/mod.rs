//! Periodic sampling and health state machine
//!
//! - [`health`] - Consecutive-failure counts and the Healthy/Alert decision
//! - [`smoothing`] - Optional moving average over readings
//! - [`scheduler`] - The sampling task itself
//!
//! Property names produced here follow `<node>/<channel>` for sensor values
//! and `system/<name>` for the daemon's own status.

pub mod health;
pub mod scheduler;
pub mod smoothing;

pub use health::{HealthTracker, SystemStatus};
pub use scheduler::{IterationReport, SamplingLoop};
pub use smoothing::{MovingAverage, Smoother};

use crate::config::TelemetryConfig;
use crate::link::DeviceKind;
use crate::registry::{PropertyDecl, PropertyRegistry, RegistryError};
use crate::transport::mqtt::STATE_ATTRIBUTE;
use std::net::{IpAddr, UdpSocket};

pub const UPTIME_PROPERTY: &str = "system/uptime";
pub const STATUS_PROPERTY: &str = "system/status";
pub const IP_ADDRESS_PROPERTY: &str = "system/ip-address";
pub const CPU_TEMPERATURE_PROPERTY: &str = "system/cpu-temperature";

/// Kernel thermal zone reporting the SoC temperature in millidegrees
pub const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// `system/status` text while every device is healthy
pub const HEALTHY_MESSAGE: &str = "Healthy";

/// Registry name of a sensor channel
pub fn property_name(node: &str, channel: &str) -> String {
    format!("{node}/{channel}")
}

/// Declare the full property schema in replay order
///
/// `$state` comes first, then one node per configured sensor, then the
/// `system` node.
pub fn declare_properties(
    registry: &PropertyRegistry,
    config: &TelemetryConfig,
) -> Result<(), RegistryError> {
    registry.declare(PropertyDecl::text(STATE_ATTRIBUTE, "State", "init"))?;

    for sensor in &config.sensors {
        for channel in DeviceKind::from(sensor.kind).channels() {
            let mut decl = PropertyDecl::numeric(
                property_name(&sensor.node, channel.id),
                channel.display_name,
                0.0,
            );
            if let Some(unit) = channel.unit {
                decl = decl.with_unit(unit);
            }
            if let Some(precision) = channel.precision {
                decl = decl.with_precision(precision);
            }
            registry.declare(decl)?;
        }
    }

    registry.declare(
        PropertyDecl::numeric(UPTIME_PROPERTY, "Uptime", 0.0)
            .with_unit("h")
            .with_precision(2),
    )?;
    registry.declare(PropertyDecl::text(STATUS_PROPERTY, "Status", HEALTHY_MESSAGE))?;

    registry.declare(PropertyDecl::text(
        IP_ADDRESS_PROPERTY,
        "IP address",
        ip_address_text(),
    ))?;

    if config.sampling.cpu_temperature {
        registry.declare(
            PropertyDecl::numeric(CPU_TEMPERATURE_PROPERTY, "CPU temperature", 0.0)
                .with_unit("°C")
                .with_precision(1),
        )?;
    }
    Ok(())
}

/// `system/ip-address` payload; "unknown" while no route exists
pub fn ip_address_text() -> String {
    local_ip_address()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Address of the interface that routes to the outside world
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ip_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Parse a thermal zone reading in millidegrees Celsius
pub fn parse_thermal_millidegrees(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .map(|milli| milli as f64 / 1000.0)
}
