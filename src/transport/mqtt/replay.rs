//! Retained-state replay and delta publishing
//!
//! On every new broker generation the whole registry is re-announced: Homie
//! metadata first, then each value in declaration order. Only after that are
//! deltas published. While disconnected, pending deltas are discarded since the
//! next replay covers them.

use super::connection::{ConnectionState, TopicBuilder};
use crate::registry::{node_of, PropertyDescriptor, PropertyRegistry};
use crate::transport::PropertySink;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Homie convention version announced as `$homie`
pub const HOMIE_VERSION: &str = "4.0";

/// What a [`StatePublisher::sync`] call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Replayed { generation: u64, published: usize },
    Deltas(usize),
    Discarded(usize),
}

/// Publishes registry state to a [`PropertySink`]
pub struct StatePublisher {
    registry: Arc<PropertyRegistry>,
    topics: TopicBuilder,
    device_name: String,
    node_names: HashMap<String, String>,
    replayed_generation: Option<u64>,
}

impl StatePublisher {
    pub fn new(registry: Arc<PropertyRegistry>, topics: TopicBuilder, device_name: &str) -> Self {
        Self {
            registry,
            topics,
            device_name: device_name.to_string(),
            node_names: HashMap::new(),
            replayed_generation: None,
        }
    }

    /// Human readable `$name` for a node; defaults to the capitalised id
    pub fn with_node_name(mut self, node: &str, name: &str) -> Self {
        self.node_names.insert(node.to_string(), name.to_string());
        self
    }

    pub fn needs_replay(&self, generation: u64) -> bool {
        self.replayed_generation != Some(generation)
    }

    pub fn replayed_generation(&self) -> Option<u64> {
        self.replayed_generation
    }

    /// Bring the broker in line with the registry for the given session state
    pub async fn sync<S: PropertySink>(
        &mut self,
        sink: &S,
        state: &ConnectionState,
    ) -> Result<SyncOutcome, S::Error> {
        match state.generation() {
            Some(generation) if self.needs_replay(generation) => {
                let published = self.replay(sink, generation).await?;
                Ok(SyncOutcome::Replayed {
                    generation,
                    published,
                })
            }
            Some(_) => Ok(SyncOutcome::Deltas(self.publish_deltas(sink).await?)),
            None => Ok(SyncOutcome::Discarded(self.discard())),
        }
    }

    /// Publish metadata and every value; returns the number of values published
    pub async fn replay<S: PropertySink>(
        &mut self,
        sink: &S,
        generation: u64,
    ) -> Result<usize, S::Error> {
        info!(generation, "Replaying retained state");
        self.registry.request_replay();

        for (topic, payload) in self.metadata() {
            sink.publish(&topic, payload, true).await?;
        }

        let mut published = 0;
        for entry in &self.registry.snapshot() {
            sink.publish(&self.topics.property_topic(&entry.name), entry.payload, true)
                .await?;
            // Name came from the registry itself, so this cannot be unknown
            let _ = self.registry.mark_published(&entry.name, &entry.value);
            published += 1;
        }

        self.replayed_generation = Some(generation);
        debug!(generation, published, "Replay complete");
        Ok(published)
    }

    /// Publish properties whose current value has not reached the broker yet
    pub async fn publish_deltas<S: PropertySink>(&self, sink: &S) -> Result<usize, S::Error> {
        let pending = self.registry.pending();
        let count = pending.len();
        for entry in pending {
            sink.publish(&self.topics.property_topic(&entry.name), entry.payload, true)
                .await?;
            let _ = self.registry.mark_published(&entry.name, &entry.value);
        }
        if count > 0 {
            debug!(count, "Published property deltas");
        }
        Ok(count)
    }

    pub fn discard(&self) -> usize {
        let dropped = self.registry.discard_pending();
        if dropped > 0 {
            debug!(dropped, "Dropped deltas while disconnected");
        }
        dropped
    }

    /// Homie attribute topics and payloads in announcement order
    pub fn metadata(&self) -> Vec<(String, String)> {
        let descriptors = self.registry.descriptors();
        let nodes = group_by_node(&descriptors);

        let mut entries = vec![
            (self.topics.property_topic("$homie"), HOMIE_VERSION.to_string()),
            (self.topics.property_topic("$name"), self.device_name.clone()),
            (
                self.topics.property_topic("$nodes"),
                nodes
                    .iter()
                    .map(|(node, _)| *node)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ];

        for (node, properties) in &nodes {
            entries.push((
                self.topics.property_topic(&format!("{node}/$name")),
                self.node_names
                    .get(*node)
                    .cloned()
                    .unwrap_or_else(|| node_display_name(node)),
            ));
            entries.push((
                self.topics.property_topic(&format!("{node}/$properties")),
                properties
                    .iter()
                    .map(|descriptor| property_id(&descriptor.name))
                    .collect::<Vec<_>>()
                    .join(","),
            ));

            for descriptor in properties {
                let base = &descriptor.name;
                entries.push((
                    self.topics.property_topic(&format!("{base}/$name")),
                    descriptor.display_name.clone(),
                ));
                entries.push((
                    self.topics.property_topic(&format!("{base}/$datatype")),
                    descriptor.kind.datatype().to_string(),
                ));
                if let Some(unit) = &descriptor.unit {
                    entries.push((
                        self.topics.property_topic(&format!("{base}/$unit")),
                        unit.clone(),
                    ));
                }
                entries.push((
                    self.topics.property_topic(&format!("{base}/$retained")),
                    descriptor.retained.to_string(),
                ));
            }
        }

        entries
    }
}

fn group_by_node(descriptors: &[PropertyDescriptor]) -> Vec<(&str, Vec<&PropertyDescriptor>)> {
    let mut nodes: Vec<(&str, Vec<&PropertyDescriptor>)> = Vec::new();
    for descriptor in descriptors {
        let Some(node) = node_of(&descriptor.name) else {
            continue;
        };
        match nodes.iter_mut().find(|(name, _)| *name == node) {
            Some((_, members)) => members.push(descriptor),
            None => nodes.push((node, vec![descriptor])),
        }
    }
    nodes
}

fn property_id(name: &str) -> &str {
    name.split_once('/').map_or(name, |(_, id)| id)
}

fn node_display_name(node: &str) -> String {
    let mut chars = node.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
