//! Mock implementations for testing
//!
//! Provides mock PropertySink, DeviceLink and PointWriter implementations
//! to enable testing without a broker, hardware or InfluxDB.

use crate::link::{DeviceHandle, DeviceLink, LinkError, LinkEvent, Reading};
use crate::sink::{Point, PointWriter, SinkError};
use crate::transport::{MqttError, PropertySink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Message captured by [`MockSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock broker sink recording every publish
#[derive(Debug, Default)]
pub struct MockSink {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub should_fail: AtomicBool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let sink = Self::default();
        sink.set_should_fail(true);
        sink
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        lock(&self.published)
            .iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload.clone())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.published).clear();
    }
}

#[async_trait]
impl PropertySink for MockSink {
    type Error = MqttError;

    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }
}

/// Mock device link driven by the test
///
/// Every read returns the configured readings, or fails while
/// `should_fail` is set. A read delay simulates a device that stops
/// answering. Events are injected with [`MockLink::emit`].
#[derive(Debug, Default)]
pub struct MockLink {
    pub readings: Mutex<Vec<Reading>>,
    pub should_fail: AtomicBool,
    read_delay_ms: AtomicU64,
    events: tokio::sync::Mutex<Option<mpsc::Sender<LinkEvent>>>,
    enumerate_calls: AtomicUsize,
    read_calls: AtomicUsize,
    stopped: AtomicBool,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: Vec<Reading>) -> Self {
        let link = Self::default();
        link.set_readings(readings);
        link
    }

    pub fn set_readings(&self, readings: Vec<Reading>) {
        *lock(&self.readings) = readings;
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Deliver an event as if the hardware raised it
    pub async fn emit(&self, event: LinkEvent) {
        if let Some(sender) = self.events.lock().await.as_ref() {
            let _ = sender.send(event).await;
        }
    }

    pub fn enumerate_calls(&self) -> usize {
        self.enumerate_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        *self.events.lock().await = Some(events);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enumerate(&self) -> Result<(), LinkError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.read_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LinkError::ReadFailed(format!(
                "Mock read failure for {}",
                handle.identifier
            )));
        }
        Ok(lock(&self.readings).clone())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.events.lock().await.take();
    }
}

/// Mock time-series writer
#[derive(Debug, Default)]
pub struct MockPointWriter {
    pub points: Arc<Mutex<Vec<Point>>>,
    pub should_fail: AtomicBool,
}

impl MockPointWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn points(&self) -> Vec<Point> {
        lock(&self.points).clone()
    }
}

#[async_trait]
impl PointWriter for MockPointWriter {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                status: 500,
                body: "Mock write failure".to_string(),
            });
        }
        lock(&self.points).extend_from_slice(points);
        Ok(())
    }
}
