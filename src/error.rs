//! Top-level error type for the telemetry daemon
//!
//! Each component has its own error enum; `DaemonError` aggregates them at
//! the startup and shutdown boundary. Errors inside running tasks are logged
//! where they occur and never reach this type.

use crate::sink::SinkError;
use crate::transport::MqttError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Property registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("Broker error: {0}")]
    Broker(#[from] MqttError),

    #[error("Device link error: {0}")]
    Link(#[from] crate::link::LinkError),

    #[error("Time-series sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Daemon already started")]
    AlreadyStarted,
}

impl DaemonError {
    /// Startup failures caused by the configuration rather than the environment
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaemonError::Config(_)
                | DaemonError::Registry(_)
                | DaemonError::Broker(MqttError::InvalidBrokerUrl(_))
                | DaemonError::Sink(SinkError::InvalidUrl(_))
        )
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
