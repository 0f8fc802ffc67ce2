//! Periodic copy of registry values into a [`PointWriter`]

use super::{Point, PointWriter, SinkError};
use crate::config::{SinkSection, SYSTEM_NODE};
use crate::registry::{node_of, PropertyKind, PropertyRegistry};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Registry property mirrored under an InfluxDB field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredField {
    pub property: String,
    pub field: String,
}

pub struct MirrorLoop {
    registry: Arc<PropertyRegistry>,
    writer: Arc<dyn PointWriter>,
    measurement: String,
    device_id: String,
    fields: Vec<MirroredField>,
    interval: Duration,
}

impl MirrorLoop {
    pub fn new(
        registry: Arc<PropertyRegistry>,
        writer: Arc<dyn PointWriter>,
        config: &SinkSection,
        device_id: &str,
    ) -> Self {
        let fields = mirrored_fields(&registry, &config.properties);
        Self {
            registry,
            writer,
            measurement: config.measurement.clone(),
            device_id: device_id.to_string(),
            fields,
            interval: Duration::from_secs(config.interval_secs),
        }
    }

    pub fn fields(&self) -> &[MirroredField] {
        &self.fields
    }

    /// Point with every mirrored property written at least once
    pub fn build_point(&self) -> Point {
        let mut point =
            Point::new(self.measurement.as_str(), Utc::now()).tag("device", self.device_id.as_str());
        for mirrored in &self.fields {
            let Some(property) = self.registry.property(&mirrored.property) else {
                continue;
            };
            if property.updated_at.is_none() {
                continue;
            }
            if let Some(value) = property.current.as_f64() {
                point = point.field(mirrored.field.as_str(), value);
            }
        }
        point
    }

    /// Write one point; returns `Ok(false)` when nothing has been sampled yet
    pub async fn run_once(&self) -> Result<bool, SinkError> {
        let point = self.build_point();
        if !point.has_fields() {
            return Ok(false);
        }
        self.writer.write(std::slice::from_ref(&point)).await?;
        Ok(true)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            measurement = %self.measurement,
            fields = self.fields.len(),
            "Time-series mirror started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => match self.run_once().await {
                    Ok(true) => {}
                    Ok(false) => debug!("No sampled values to mirror yet"),
                    Err(e) => warn!("Time-series write failed: {}", e),
                }
            }
        }
        info!("Time-series mirror stopped");
    }
}

/// Resolve the configured property list; empty means every numeric sensor property
pub fn mirrored_fields(registry: &PropertyRegistry, configured: &[String]) -> Vec<MirroredField> {
    let names: Vec<String> = if configured.is_empty() {
        registry
            .descriptors()
            .into_iter()
            .filter(|d| d.kind == PropertyKind::Numeric)
            .filter(|d| matches!(node_of(&d.name), Some(node) if node != SYSTEM_NODE))
            .map(|d| d.name)
            .collect()
    } else {
        configured
            .iter()
            .filter(|name| {
                let known = registry.contains(name);
                if !known {
                    warn!(property = %name, "Ignoring unknown property in sink configuration");
                }
                known
            })
            .cloned()
            .collect()
    };

    let mut used = HashSet::new();
    names
        .into_iter()
        .map(|property| {
            let (node, id) = property.split_once('/').unwrap_or(("", property.as_str()));
            let mut field = pascal_case(id);
            if !used.insert(field.clone()) {
                field = format!("{}{}", pascal_case(node), field);
                used.insert(field.clone());
            }
            MirroredField {
                property: property.clone(),
                field,
            }
        })
        .collect()
}

/// `quality-index` becomes `QualityIndex`
pub fn pascal_case(id: &str) -> String {
    id.split(&['-', '_', '/'][..])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
