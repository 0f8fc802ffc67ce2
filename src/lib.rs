//! Homie Telemetry - unattended sensor daemon
//!
//! Samples environmental sensors over a hardware link and publishes their
//! values as Homie properties on an MQTT broker, optionally mirroring them
//! into an InfluxDB v2 bucket.
//!
//! # Overview
//!
//! - [`registry`]: the property schema and latest values, the single source
//!   of truth replayed to the broker after every reconnect
//! - [`transport`]: the MQTT broker session with backoff and state replay
//! - [`link`]: device links (Tinkerforge TCP protocol, simulated) and the
//!   monitor that rebinds device handles after a link reconnect
//! - [`sampling`]: the periodic sampling loop and failure tracking
//! - [`sink`]: the time-series mirror
//! - [`daemon`]: wiring and ordered shutdown
//!
//! # Quick Start
//!
//! ```rust
//! use homie_telemetry::registry::{PropertyDecl, PropertyRegistry, PropertyValue};
//!
//! let registry = PropertyRegistry::new();
//! registry
//!     .declare(PropertyDecl::numeric("ambient/temperature", "Temperature", 0.0).with_unit("°C"))
//!     .unwrap();
//! registry.set("ambient/temperature", 21.5).unwrap();
//!
//! assert_eq!(
//!     registry.get("ambient/temperature"),
//!     Some(PropertyValue::Number(21.5))
//! );
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod link;
pub mod observability;
pub mod registry;
pub mod sampling;
pub mod sink;
pub mod testing;
pub mod transport;

pub use config::TelemetryConfig;
pub use daemon::TelemetryDaemon;
pub use error::{DaemonError, DaemonResult};
pub use link::{DeviceHandle, DeviceKind, DeviceLink, LinkEvent, LinkMonitor, Reading};
pub use registry::{PropertyRegistry, PropertyValue};
pub use sampling::{SamplingLoop, SystemStatus};
pub use transport::{BrokerSession, ConnectionState, PropertySink};
