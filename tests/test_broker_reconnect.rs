//! Broker session against a real socket that goes away and comes back
//!
//! A scripted MQTT v5 broker on localhost accepts the session, acknowledges
//! publishes and records them. Killing it drops every connection; restarting
//! it binds the same port with no retained state, so whatever arrives after
//! the restart is exactly what the session replays.

mod test_helpers;

use bytes::BytesMut;
use homie_telemetry::registry::PropertyRegistry;
use homie_telemetry::transport::mqtt::StatePublisher;
use homie_telemetry::BrokerSession;
use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Packet, PingResp, PubAck};
use rumqttc::v5::mqttbytes::{Error as PacketError, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{declared_registry, publisher, test_config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TEMPERATURE_TOPIC: &str = "homie/air-monitor/ambient/temperature";
const NODES_TOPIC: &str = "homie/air-monitor/$nodes";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Received {
    topic: String,
    payload: String,
    retain: bool,
}

struct ScriptedBroker {
    port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ScriptedBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = Self {
            port,
            received: Arc::new(Mutex::new(Vec::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        broker.serve(listener);
        broker
    }

    fn serve(&self, listener: TcpListener) {
        let received = self.received.clone();
        let tasks = self.tasks.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = tokio::spawn(serve_connection(stream, received.clone()));
                tasks.lock().unwrap().push(connection);
            }
        });
        self.tasks.lock().unwrap().push(accept);
    }

    /// Drop the listener and every open connection
    async fn kill(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    /// Listen again on the same port with an empty retained store
    async fn restart(&self) {
        self.received.lock().unwrap().clear();
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await.unwrap();
        self.serve(listener);
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload)
            .collect()
    }

    fn position_of(&self, topic: &str) -> Option<usize> {
        self.received()
            .iter()
            .position(|message| message.topic == topic)
    }
}

async fn serve_connection(mut stream: TcpStream, received: Arc<Mutex<Vec<Received>>>) {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        let packet = match Packet::read(&mut buffer, None) {
            Ok(packet) => packet,
            Err(PacketError::InsufficientBytes(_)) => match stream.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let reply = match packet {
            Packet::Connect(..) => Some(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
                properties: None,
            })),
            Packet::Publish(publish) => {
                received.lock().unwrap().push(Received {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                    retain: publish.retain,
                });
                (publish.qos == QoS::AtLeastOnce)
                    .then(|| Packet::PubAck(PubAck::new(publish.pkid, None)))
            }
            Packet::PingReq(_) => Some(Packet::PingResp(PingResp)),
            Packet::Disconnect(_) => return,
            _ => None,
        };

        if let Some(reply) = reply {
            let mut out = BytesMut::new();
            if reply.write(&mut out).is_err() || stream.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"));
}

fn session(port: u16, registry: Arc<PropertyRegistry>) -> BrokerSession {
    let mut config = test_config();
    config.mqtt.broker_url = format!("mqtt://127.0.0.1:{port}");
    config.mqtt.connect_timeout_secs = 1;
    let state_publisher: StatePublisher = publisher(registry.clone());
    BrokerSession::new(
        &config.device.id,
        config.mqtt,
        registry,
        state_publisher,
        tracing::Span::none(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_broker_restart_replays_retained_state() {
    // Arrange: a connected session has published a sampled value
    let broker = ScriptedBroker::start().await;
    let registry = declared_registry();
    let mut session = session(broker.port, registry.clone());
    session.connect().unwrap();

    registry.set("ambient/temperature", 21.5).unwrap();
    wait_until("first publish", || {
        broker.payloads_for(TEMPERATURE_TOPIC).contains(&"21.50".to_string())
    })
    .await;
    assert_eq!(session.generation(), 1);

    // Act: the broker dies, a value changes meanwhile, the broker comes back empty
    broker.kill().await;
    let state_rx = session.state_receiver();
    wait_until("session to notice the outage", || !state_rx.borrow().is_connected()).await;

    registry.set("ambient/temperature", 22.0).unwrap();
    broker.restart().await;

    wait_until("replay after restart", || {
        !broker.payloads_for(TEMPERATURE_TOPIC).is_empty()
    })
    .await;

    // Assert: one retained replay of the latest value, after the metadata
    assert_eq!(session.generation(), 2);
    assert_eq!(broker.payloads_for(TEMPERATURE_TOPIC), vec!["22.00"]);
    let nodes = broker.position_of(NODES_TOPIC).expect("metadata replayed");
    let value = broker.position_of(TEMPERATURE_TOPIC).unwrap();
    assert!(nodes < value, "Metadata must precede values");
    assert!(broker
        .received()
        .iter()
        .filter(|message| message.topic == TEMPERATURE_TOPIC)
        .all(|message| message.retain));

    session.disconnect().await.unwrap();
    wait_until("offline state", || {
        broker
            .payloads_for("homie/air-monitor/$state")
            .last()
            .is_some_and(|state| state == "disconnected")
    })
    .await;
}

#[tokio::test]
async fn test_session_started_while_broker_down_publishes_once_up() {
    // Arrange: reserve a port, then close it so the first attempts are refused
    let broker = ScriptedBroker::start().await;
    broker.kill().await;
    let registry = declared_registry();
    registry.set("ambient/humidity", 40.0).unwrap();
    let mut session = session(broker.port, registry.clone());

    // Act
    session.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!session.state().is_connected());
    assert!(session.is_running());
    broker.restart().await;

    // Assert
    wait_until("late first connection", || {
        broker
            .payloads_for("homie/air-monitor/ambient/humidity")
            .contains(&"40.00".to_string())
    })
    .await;
    assert_eq!(session.generation(), 1);

    session.disconnect().await.unwrap();
}
