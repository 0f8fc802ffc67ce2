//! Time-series mirror
//!
//! A subset of numeric properties is periodically written to InfluxDB as line
//! protocol. Sink failures are logged and never reach the sampling path.

pub mod influx;
pub mod mirror;
pub mod point;

pub use influx::InfluxWriter;
pub use mirror::MirrorLoop;
pub use point::Point;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("InfluxDB rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Invalid sink URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("No fields to write")]
    EmptyBatch,
}

/// Destination for time-series points
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}
