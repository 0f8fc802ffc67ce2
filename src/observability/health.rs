//! Health check HTTP server
//!
//! Reports the broker session state, the device link generation and the
//! aggregate sensor status for operators and process supervisors.

use crate::sampling::SystemStatus;
use crate::transport::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    started: Instant,
    broker_state: watch::Receiver<ConnectionState>,
    link_generation: watch::Receiver<u64>,
    system_status: watch::Receiver<SystemStatus>,
}

impl HealthServer {
    pub fn new(
        device_id: &str,
        port: u16,
        broker_state: watch::Receiver<ConnectionState>,
        link_generation: watch::Receiver<u64>,
        system_status: watch::Receiver<SystemStatus>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            port,
            started: Instant::now(),
            broker_state,
            link_generation,
            system_status,
        }
    }

    /// All endpoints, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - per-check status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /ready - broker and link both up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.is_ready();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        // GET /live - process is serving requests
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        health_route.or(ready_route).or(live_route)
    }

    /// Serve until `shutdown_rx` turns true
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), warp::Error> {
        let routes = self.routes();
        let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(
            SocketAddr::from(([0, 0, 0, 0], self.port)),
            async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            },
        )?;

        tracing::info!(%addr, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.broker_state.borrow().is_connected() && *self.link_generation.borrow() > 0
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = BTreeMap::new();
        checks.insert("broker".to_string(), self.check_broker(now));
        checks.insert("link".to_string(), self.check_link(now));
        checks.insert("sensors".to_string(), self.check_sensors(now));

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            device_id: self.device_id.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            checks,
        }
    }

    fn check_broker(&self, now: u64) -> HealthCheck {
        let state = self.broker_state.borrow().clone();
        match state {
            ConnectionState::Connected { generation } => {
                HealthCheck::healthy(format!("Connected (session {generation})"), now)
            }
            other => HealthCheck::unhealthy(format!("Broker {}", other.label()), now),
        }
    }

    fn check_link(&self, now: u64) -> HealthCheck {
        match *self.link_generation.borrow() {
            0 => HealthCheck::unhealthy("Device link not connected yet".to_string(), now),
            generation => HealthCheck::healthy(format!("Link generation {generation}"), now),
        }
    }

    fn check_sensors(&self, now: u64) -> HealthCheck {
        match *self.system_status.borrow() {
            SystemStatus::Healthy => HealthCheck::healthy("All sensors reporting".to_string(), now),
            SystemStatus::Alert => {
                HealthCheck::unhealthy("Sensor failures above threshold".to_string(), now)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: String, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message),
            last_check: now,
        }
    }

    fn unhealthy(message: String, now: u64) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
