//! TCP connection to a Brick Daemon
//!
//! A supervisor task owns the socket: it connects, raises
//! `LinkReconnected`, reads packets until the connection drops and then
//! retries after a fixed delay. Responses are matched to requests by
//! (UID, function id, sequence number).

use super::codec::{
    base58_decode, decode_packet, encode_request, AirQualityValues, Enumeration, EnumerationType,
    Packet, CALLBACK_ENUMERATE, FUNCTION_AIR_QUALITY_GET_ALL_VALUES, FUNCTION_ENUMERATE,
};
use crate::link::{DeviceHandle, DeviceKind, DeviceLink, LinkError, LinkEvent, Reading};
use bytes::BytesMut;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

type PendingKey = (u32, u8, u8);

#[derive(Default)]
struct Shared {
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: std::sync::Mutex<HashMap<PendingKey, oneshot::Sender<Packet>>>,
    sequence: AtomicU8,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<PendingKey, oneshot::Sender<Packet>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence numbers cycle through 1..=15; 0 is reserved for callbacks
    fn next_sequence(&self) -> u8 {
        let previous = self
            .sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| {
                Some(if seq >= 15 { 1 } else { seq + 1 })
            })
            .unwrap_or(0);
        if previous >= 15 {
            1
        } else {
            previous + 1
        }
    }

    async fn send(&self, packet: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(LinkError::NotConnected)?;
        stream.write_all(packet).await?;
        Ok(())
    }
}

/// Device link over the Tinkerforge TCP/IP protocol
pub struct TinkerforgeLink {
    host: String,
    port: u16,
    read_timeout: Duration,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TinkerforgeLink {
    pub fn new(host: &str, port: u16, read_timeout: Duration, reconnect_delay: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            host: host.to_string(),
            port,
            read_timeout,
            reconnect_delay,
            shared: Arc::new(Shared::default()),
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    /// Send a request and wait for the matching response
    async fn request(&self, identifier: &str, function_id: u8) -> Result<Packet, LinkError> {
        let uid = base58_decode(identifier)?;
        let sequence = self.shared.next_sequence();
        let key = (uid, function_id, sequence);

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(key, tx);

        let packet = encode_request(uid, function_id, sequence, true, &[]);
        if let Err(e) = self.shared.send(&packet).await {
            self.shared.pending().remove(&key);
            return Err(e);
        }

        let packet = match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(packet)) => packet,
            // Sender dropped: the connection went away
            Ok(Err(_)) => return Err(LinkError::NotConnected),
            Err(_) => {
                self.shared.pending().remove(&key);
                return Err(LinkError::Timeout {
                    identifier: identifier.to_string(),
                    function_id,
                });
            }
        };

        if packet.header.error_code != 0 {
            return Err(LinkError::DeviceError {
                identifier: identifier.to_string(),
                code: packet.header.error_code,
            });
        }
        Ok(packet)
    }
}

#[async_trait::async_trait]
impl DeviceLink for TinkerforgeLink {
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> Result<(), LinkError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(false);

        let task = Supervisor {
            address: format!("{}:{}", self.host, self.port),
            reconnect_delay: self.reconnect_delay,
            shared: self.shared.clone(),
            events,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        *supervisor = Some(tokio::spawn(
            task.run(shutdown_rx).in_current_span(),
        ));
        Ok(())
    }

    async fn enumerate(&self) -> Result<(), LinkError> {
        let sequence = self.shared.next_sequence();
        let packet = encode_request(0, FUNCTION_ENUMERATE, sequence, false, &[]);
        self.shared.send(&packet).await
    }

    async fn read(&self, handle: &DeviceHandle) -> Result<Vec<Reading>, LinkError> {
        match handle.kind {
            DeviceKind::AirQuality => {
                let packet = self
                    .request(&handle.identifier, FUNCTION_AIR_QUALITY_GET_ALL_VALUES)
                    .await?;
                let values = AirQualityValues::decode(&packet.payload)?;
                Ok(vec![
                    Reading::new("pressure", values.air_pressure),
                    Reading::new("temperature", values.temperature),
                    Reading::new("humidity", values.humidity),
                    Reading::new("quality-index", f64::from(values.iaq_index)),
                ])
            }
            kind => Err(LinkError::UnsupportedKind {
                identifier: handle.identifier.clone(),
                kind,
            }),
        }
    }

    async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("Brick Daemon supervisor did not stop in time");
            }
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

struct Supervisor {
    address: String,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    events: mpsc::Sender<LinkEvent>,
}

impl Supervisor {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    *self.shared.writer.lock().await = Some(writer);
                    info!(address = %self.address, "Connected to Brick Daemon");

                    let event = LinkEvent::LinkReconnected { at: Utc::now() };
                    if self.events.send(event).await.is_err() {
                        break;
                    }

                    let reason = self.read_loop(reader, &mut shutdown_rx).await;
                    self.shared.writer.lock().await.take();
                    // Dropping the senders fails every in-flight request
                    self.shared.pending().clear();

                    match reason {
                        Some(reason) => warn!(address = %self.address, "Brick Daemon connection lost: {}", reason),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(address = %self.address, "Brick Daemon connection failed: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        debug!("Brick Daemon supervisor stopped");
    }

    /// Returns the reason the connection ended, `None` on shutdown
    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return None;
                    }
                }
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => return Some("connection closed by peer".to_string()),
                    Ok(_) => loop {
                        match decode_packet(&mut buf) {
                            Ok(Some(packet)) => self.dispatch(packet).await,
                            Ok(None) => break,
                            Err(e) => return Some(format!("protocol error: {e}")),
                        }
                    },
                    Err(e) => return Some(e.to_string()),
                }
            }
        }
    }

    async fn dispatch(&self, packet: Packet) {
        let header = packet.header;
        if header.is_callback() {
            if header.function_id == CALLBACK_ENUMERATE {
                self.handle_enumeration(&packet).await;
            } else {
                debug!(uid = header.uid, function_id = header.function_id, "Ignoring callback");
            }
            return;
        }

        let key = (header.uid, header.function_id, header.sequence);
        match self.shared.pending().remove(&key) {
            Some(waiter) => {
                let _ = waiter.send(packet);
            }
            None => debug!(?key, "Response without pending request"),
        }
    }

    async fn handle_enumeration(&self, packet: &Packet) {
        let enumeration = match Enumeration::decode(&packet.payload) {
            Ok(enumeration) => enumeration,
            Err(e) => {
                warn!("Malformed enumerate callback: {}", e);
                return;
            }
        };

        match enumeration.enumeration_type {
            EnumerationType::Available | EnumerationType::Connected => {
                let kind = DeviceKind::from_device_identifier(enumeration.device_identifier);
                debug!(uid = %enumeration.uid, %kind, "Device enumerated");
                let event = LinkEvent::DeviceAvailable {
                    identifier: enumeration.uid,
                    kind,
                };
                if self.events.send(event).await.is_err() {
                    debug!("Link event receiver closed");
                }
            }
            EnumerationType::Disconnected => {
                info!(uid = %enumeration.uid, "Device disconnected");
            }
            EnumerationType::Unknown(value) => {
                debug!(uid = %enumeration.uid, value, "Unknown enumeration type");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::{base58_encode, Header, HEADER_LEN};
    use super::*;
    use bytes::BufMut;
    use tokio::net::TcpListener;

    fn response(uid: u32, function_id: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(uid);
        buf.put_u8((HEADER_LEN + payload.len()) as u8);
        buf.put_u8(function_id);
        buf.put_u8(sequence << 4);
        buf.put_u8(0);
        buf.put_slice(payload);
        buf
    }

    fn enumerate_callback(uid: &str, device_identifier: u16) -> Vec<u8> {
        let enumeration = Enumeration {
            uid: uid.to_string(),
            connected_uid: "0".to_string(),
            position: 'a',
            hardware_version: [1, 0, 0],
            firmware_version: [2, 0, 0],
            device_identifier,
            enumeration_type: EnumerationType::Available,
        };
        response(base58_decode(uid).unwrap(), CALLBACK_ENUMERATE, 0, &enumeration.encode())
    }

    #[test]
    fn test_sequence_cycles_one_to_fifteen() {
        let shared = Shared::default();
        let sequences: Vec<u8> = (0..17).map(|_| shared.next_sequence()).collect();
        assert_eq!(sequences[0], 1);
        assert_eq!(sequences[14], 15);
        assert_eq!(sequences[15], 1);
        assert!(sequences.iter().all(|s| (1..=15).contains(s)));
    }

    #[tokio::test]
    async fn test_enumerate_and_read_against_fake_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uid = base58_encode(0x1234);

        let daemon_uid = uid.clone();
        let daemon = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            loop {
                if socket.read_buf(&mut buf).await.unwrap() == 0 {
                    return;
                }
                while let Some(packet) = decode_packet(&mut buf).unwrap() {
                    let Header { uid, function_id, sequence, .. } = packet.header;
                    if function_id == FUNCTION_ENUMERATE {
                        socket
                            .write_all(&enumerate_callback(&daemon_uid, 297))
                            .await
                            .unwrap();
                    } else if function_id == FUNCTION_AIR_QUALITY_GET_ALL_VALUES {
                        let mut values = Vec::new();
                        values.put_i32_le(50);
                        values.put_u8(3);
                        values.put_i32_le(2150);
                        values.put_i32_le(4000);
                        values.put_i32_le(100_000);
                        socket
                            .write_all(&response(uid, function_id, sequence, &values))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let link = TinkerforgeLink::new(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        let (events_tx, mut events_rx) = mpsc::channel(8);
        link.start(events_tx).await.unwrap();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            LinkEvent::LinkReconnected { .. }
        ));
        link.enumerate().await.unwrap();
        assert_eq!(
            events_rx.recv().await.unwrap(),
            LinkEvent::DeviceAvailable {
                identifier: uid.clone(),
                kind: DeviceKind::AirQuality
            }
        );

        let handle = DeviceHandle {
            identifier: uid,
            kind: DeviceKind::AirQuality,
            bound_at: 1,
        };
        let readings = link.read(&handle).await.unwrap();
        assert_eq!(readings[1], Reading::new("temperature", 21.5));
        assert_eq!(readings[3], Reading::new("quality-index", 50.0));

        link.stop().await;
        daemon.abort();
    }

    #[tokio::test]
    async fn test_read_without_connection_fails() {
        let link = TinkerforgeLink::new(
            "127.0.0.1",
            1,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let handle = DeviceHandle {
            identifier: base58_encode(7),
            kind: DeviceKind::AirQuality,
            bound_at: 1,
        };
        assert!(matches!(
            link.read(&handle).await,
            Err(LinkError::NotConnected)
        ));
    }
}
