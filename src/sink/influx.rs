//! InfluxDB v2 HTTP write API client

use super::{Point, PointWriter, SinkError};
use crate::config::SinkSection;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    token: Option<String>,
}

impl InfluxWriter {
    pub fn new(config: &SinkSection, token: Option<String>) -> Result<Self, SinkError> {
        let mut base = Url::parse(&config.url)?;
        // join() replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let mut write_url = base.join("api/v2/write")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(SinkError::Http)?;

        Ok(Self {
            client,
            write_url,
            token,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let body = points
            .iter()
            .filter(|point| point.has_fields())
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        if body.is_empty() {
            return Err(SinkError::EmptyBatch);
        }

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(points = points.len(), "Wrote points to InfluxDB");
        Ok(())
    }
}
