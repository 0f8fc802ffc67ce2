//! Observability: structured logging, log forwarding and the HTTP health endpoint

pub mod health;
pub mod logging;
pub mod mqtt_log;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, init_logging_with, LogFormat};
pub use mqtt_log::{forwarding_layer, LogForwarder, LogReceiver, LogRecord, MqttLogLayer};

// Span macros for structured logging
pub use logging::{lifecycle_span, link_span, sampling_span, session_span, sink_span};
