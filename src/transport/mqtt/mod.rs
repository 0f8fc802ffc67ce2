//! MQTT broker session publishing Homie properties
//!
//! This module separates pure functions from I/O operations for better
//! testability and maintainability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state, backoff, options and topics
//! - [`message_handler`] - Pure event routing plus subscription fan-out
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`replay`] - Registry replay and delta publishing over a [`PropertySink`]
//! - [`session`] - Impure I/O: event loop poller, publisher task, public API
//!
//! [`PropertySink`]: crate::transport::PropertySink
//!
//! # Usage
//!
//! ```rust,no_run
//! use homie_telemetry::config::TelemetryConfig;
//! use homie_telemetry::registry::PropertyRegistry;
//! use homie_telemetry::transport::mqtt::{BrokerSession, StatePublisher, TopicBuilder};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = TelemetryConfig::load_from_file("telemetry.toml".as_ref())?;
//! let registry = Arc::new(PropertyRegistry::new());
//! let topics = TopicBuilder::new(&config.mqtt.base_topic, &config.device.id);
//! let publisher = StatePublisher::new(registry.clone(), topics, &config.device.name);
//!
//! let mut session = BrokerSession::new(
//!     &config.device.id,
//!     config.mqtt.clone(),
//!     registry,
//!     publisher,
//!     tracing::Span::current(),
//! )?;
//! session.connect()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod replay;
pub mod session;

pub use connection::{
    ConnectionState, MqttError, ReconnectConfig, TopicBuilder, LOST_STATE, STATE_ATTRIBUTE,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, InboundMessage, MessageHandler, SubscriptionRouter};
pub use replay::{StatePublisher, SyncOutcome, HOMIE_VERSION};
pub use session::{BrokerSession, PublishOutcome, SessionSink, DISCONNECTED_STATE};
