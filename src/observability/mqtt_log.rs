//! Log forwarding to the broker
//!
//! [`MqttLogLayer`] captures events on the subscriber side and hands them to
//! a bounded channel; [`LogForwarder`] drains that channel once a broker
//! session exists and publishes each line on `<topic>/<logger>/<level>`.
//! Events from the MQTT stack itself are never captured, otherwise every
//! forwarded line would produce new transport events.

use crate::transport::PropertySink;
use std::fmt::{self, Write as _};
use tokio::sync::{mpsc, watch};
use tracing::field::{Field, Visit};
use tracing::{debug, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Lines buffered between the layer and the forwarder
const FORWARD_CAPACITY: usize = 256;

/// Targets never forwarded
const UNFORWARDED_TARGETS: &[&str] = &[
    "rumqttc",
    "mqtt_transport",
    "homie_telemetry::transport",
    module_path!(),
];

/// One captured log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub logger: String,
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    /// `<base>/<logger>/<level>` with the module path flattened to dots
    pub fn topic(&self, base: &str) -> String {
        format!(
            "{}/{}/{}",
            base,
            self.logger.replace("::", "."),
            self.level.as_str().to_lowercase()
        )
    }
}

pub type LogReceiver = mpsc::Receiver<LogRecord>;

/// False for the MQTT client and this crate's transport
pub fn is_forwardable(target: &str) -> bool {
    !UNFORWARDED_TARGETS
        .iter()
        .any(|prefix| target.starts_with(prefix))
}

/// Layer plus the receiving end for [`LogForwarder`]
pub fn forwarding_layer(max_level: Level) -> (MqttLogLayer, LogReceiver) {
    let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
    (MqttLogLayer { tx, max_level }, rx)
}

pub struct MqttLogLayer {
    tx: mpsc::Sender<LogRecord>,
    max_level: Level,
}

impl<S: Subscriber> Layer<S> for MqttLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level || !is_forwardable(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Full or closed channel: the line is dropped
        let _ = self.tx.try_send(LogRecord {
            logger: metadata.target().to_string(),
            level: *metadata.level(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Publishes captured lines through a broker sink
pub struct LogForwarder<P> {
    sink: P,
    base_topic: String,
}

impl<P: PropertySink> LogForwarder<P> {
    pub fn new(sink: P, base_topic: impl Into<String>) -> Self {
        Self {
            sink,
            base_topic: base_topic.into(),
        }
    }

    pub async fn forward(&self, record: &LogRecord) -> Result<(), P::Error> {
        self.sink
            .publish_transient(&record.topic(&self.base_topic), record.message.clone())
            .await
    }

    pub async fn run(self, mut records: LogReceiver, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                record = records.recv() => {
                    let Some(record) = record else {
                        break;
                    };
                    // Dropped while disconnected; nothing is replayed
                    if let Err(e) = self.forward(&record).await {
                        debug!("Log line not forwarded: {}", e);
                    }
                }
            }
        }
    }
}
