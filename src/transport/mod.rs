//! Broker transport
//!
//! [`PropertySink`] is the seam between registry replay logic and the wire:
//! the MQTT session implements it for production, tests use the in-crate mock.

pub mod mqtt;

/// Destination for retained property publishes
#[async_trait::async_trait]
pub trait PropertySink: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a UTF-8 payload to `topic`
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), Self::Error>;

    /// Best-effort, non-retained publish for diagnostics such as forwarded logs
    async fn publish_transient(&self, topic: &str, payload: String) -> Result<(), Self::Error> {
        self.publish(topic, payload, false).await
    }
}

#[async_trait::async_trait]
impl<T: PropertySink> PropertySink for std::sync::Arc<T> {
    type Error = T::Error;

    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), Self::Error> {
        (**self).publish(topic, payload, retain).await
    }

    async fn publish_transient(&self, topic: &str, payload: String) -> Result<(), Self::Error> {
        (**self).publish_transient(topic, payload).await
    }
}

pub use mqtt::{BrokerSession, ConnectionState, MqttError, PublishOutcome};
