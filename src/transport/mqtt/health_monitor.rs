//! Pure reconnection and state transition logic for the broker session
//!
//! This module contains pure functions for reconnection decision making
//! and connection state tracking.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to retry after `current_attempts` failed attempts
    ///
    /// `jitter_sample` is a value in -1.0..=1.0 supplied by the caller so the
    /// decision itself stays deterministic.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
        jitter_sample: f64,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        let base_delay = config.calculate_backoff_delay(attempt);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.apply_jitter(base_delay, jitter_sample),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived { generation } => {
                ConnectionState::Connected { generation }
            }
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ConnectTimeout => {
                ConnectionState::Disconnected("ConnAck timeout".to_string())
            }
            ConnectionEvent::ReconnectionStarted => ConnectionState::Connecting,
            ConnectionEvent::ClosedLocally => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Allowed edges: Disconnected -> Connecting -> Connected -> Disconnected,
    /// plus Connecting -> Disconnected. Never Connected -> Connecting.
    pub fn is_valid_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
        matches!(
            (from, to),
            (ConnectionState::Disconnected(_), ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected { .. })
                | (ConnectionState::Connecting, ConnectionState::Disconnected(_))
                | (ConnectionState::Connected { .. }, ConnectionState::Disconnected(_))
                | (ConnectionState::Disconnected(_), ConnectionState::Disconnected(_))
        )
    }

    /// Check if connection state allows publishing
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected { generation }) => {
                info!(generation, "Broker connection established");
            }
            (ConnectionState::Connected { generation }, ConnectionState::Disconnected(reason)) => {
                warn!(generation, reason = %reason, "Broker connection lost");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker connection attempt failed");
            }
            (ConnectionState::Disconnected(_), ConnectionState::Connecting) => {
                info!("Connecting to broker");
            }
            _ => {
                if !Self::is_valid_transition(from, to) {
                    error!(?from, ?to, "Unexpected broker state transition");
                }
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived { generation: u64 },
    DisconnectedByBroker,
    NetworkError(String),
    /// No ConnAck within the connect timeout
    ConnectTimeout,
    ReconnectionStarted,
    ClosedLocally,
}
