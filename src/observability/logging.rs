//! Structured logging using the tracing crate
//!
//! Each long-lived component gets its own span, created with one of the span
//! macros below and passed in at construction.
//!
//! Besides stdout, the `[logging]` section can add a plain-text log file and
//! forwarding to the broker (see [`super::mqtt_log`]). Both see the same
//! events as stdout, so they are capped by the global level.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Unattended deployment
//! LOG_FORMAT=json LOG_LEVEL=INFO telemetryd run
//!
//! # Bench testing with a simulated link
//! LOG_FORMAT=compact telemetryd -vv run
//! ```

use super::mqtt_log::{forwarding_layer, LogReceiver};
use crate::config::LoggingSection;
use std::env;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies capped at `warn` unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["rumqttc", "reqwest", "hyper", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines for log collectors
    Json,
    /// Multi-line, coloured
    Pretty,
    /// Single line, coloured
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse `LOG_LEVEL` style names; unknown values mean INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Raise `base` by one level per `-v` flag
pub fn raise_level(base: Level, verbosity: u8) -> Level {
    const ORDER: [Level; 5] = [
        Level::ERROR,
        Level::WARN,
        Level::INFO,
        Level::DEBUG,
        Level::TRACE,
    ];
    let start = ORDER.iter().position(|level| *level == base).unwrap_or(2);
    ORDER[(start + verbosity as usize).min(ORDER.len() - 1)]
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    QUIET_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn open_log_file(path: &Path) -> std::io::Result<Arc<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
}

/// Install the global subscriber with stdout only
///
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    init_logging_with(level, format, include_spans, &LoggingSection::default());
}

/// Install the global subscriber with the configured extra outputs
///
/// Returns the receiving end of broker forwarding when `mqtt_topic` is set.
/// A log file that cannot be opened is reported and skipped.
pub fn init_logging_with(
    level: Level,
    format: LogFormat,
    include_spans: bool,
    outputs: &LoggingSection,
) -> Option<LogReceiver> {
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut file_error = None;
    let file_layer = outputs
        .file
        .as_deref()
        .and_then(|path| match open_log_file(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(file)),
            Err(e) => {
                file_error = Some(format!("{}: {}", path.display(), e));
                None
            }
        });

    let (mqtt_layer, records) = match &outputs.mqtt_topic {
        Some(_) => {
            let (layer, records) = forwarding_layer(parse_level(&outputs.mqtt_level));
            (Some(layer), Some(records))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(file_layer)
        .with(mqtt_layer);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    if let Some(error) = file_error {
        tracing::warn!("Log file unavailable, logging to stdout only: {}", error);
    }
    records
}

/// Initialize logging from environment variables, raised by `verbosity`
pub fn init_default_logging(verbosity: u8, outputs: &LoggingSection) -> Option<LogReceiver> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging_with(raise_level(level, verbosity), format, include_spans, outputs)
}

/// Span for the broker session tasks
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_session", $($field)*)
    };
}

/// Span for the device link and its monitor
#[macro_export]
macro_rules! link_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_link", $($field)*)
    };
}

/// Span for the sampling loop
#[macro_export]
macro_rules! sampling_span {
    ($($field:tt)*) => {
        tracing::info_span!("sampling", $($field)*)
    };
}

/// Span for the time-series mirror
#[macro_export]
macro_rules! sink_span {
    ($($field:tt)*) => {
        tracing::info_span!("time_series_sink", $($field)*)
    };
}

/// Span for daemon startup and shutdown
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {lifecycle_span, link_span, sampling_span, session_span, sink_span};
