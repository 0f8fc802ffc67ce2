//! Pure event routing plus the inbound subscription fan-out
//!
//! `MessageHandler` classifies raw broker events; `SubscriptionRouter` is the
//! impure half that forwards matching publishes to subscriber channels.

use rumqttc::v5::{mqttbytes::QoS, Event};
use rumqttc::Outgoing;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl InboundMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Pure routing decisions based on broker events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event to the appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    }),
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Property values are fire-and-forget; the registry replays anything lost
    pub fn property_qos() -> QoS {
        QoS::AtMostOnce
    }

    /// Forwarded log lines are dropped rather than queued
    pub fn log_qos() -> QoS {
        QoS::AtMostOnce
    }

    /// Lifecycle state (`$state`) is delivered at least once
    pub fn state_qos() -> QoS {
        QoS::AtLeastOnce
    }

    /// MQTT filter matching with `+` (one level) and `#` (remaining levels)
    pub fn topic_matches(filter: &str, topic: &str) -> bool {
        let mut filter_levels = filter.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return filter_levels.next().is_none(),
                (Some("+"), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

/// Routing decisions for broker events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(InboundMessage),
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// PingResp, PubAck and similar
    InfrastructureEvent(String),
    /// Our own DISCONNECT reached the socket
    DisconnectSent,
    OutgoingEvent,
}

/// Fan-out of inbound publishes to subscriber channels (impure I/O)
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    routes: Vec<(String, mpsc::Sender<InboundMessage>)>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: &str, sender: mpsc::Sender<InboundMessage>) {
        self.routes.push((filter.to_string(), sender));
    }

    /// Filters with at least one live subscriber, deduplicated
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for (filter, sender) in &self.routes {
            if !sender.is_closed() && !filters.contains(filter) {
                filters.push(filter.clone());
            }
        }
        filters
    }

    /// Forward to every matching subscriber; returns how many received it
    pub fn forward(&mut self, message: &InboundMessage) -> usize {
        self.routes.retain(|(_, sender)| !sender.is_closed());

        let mut delivered = 0;
        for (filter, sender) in &self.routes {
            if !MessageHandler::topic_matches(filter, &message.topic) {
                continue;
            }
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(topic = %message.topic, filter = %filter, "Dropping inbound message: {e}"),
            }
        }

        if delivered == 0 {
            debug!(topic = %message.topic, "No subscriber for inbound message");
        }
        delivered
    }
}
