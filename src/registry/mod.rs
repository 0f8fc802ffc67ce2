//! Property registry with retained-publish bookkeeping
//!
//! The registry is the single source of truth for "current" device state.
//! The sampling loop writes into it, the broker session reads from it: deltas
//! via [`PropertyRegistry::pending`], full replays via
//! [`PropertyRegistry::snapshot`]. Declaration order is preserved and drives
//! replay order.
//!
//! Every operation takes the inner lock for the duration of a single key, so
//! a snapshot never observes a half-updated value.

pub mod property;

pub use property::{
    node_of, Property, PropertyDecl, PropertyDescriptor, PropertyKind, PropertyValue,
};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Registry contract violations
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Property already declared: {0}")]
    DuplicateName(String),
    #[error("Unknown property: {0}")]
    UnknownProperty(String),
    #[error("Property {name} expects {expected:?} values, got {actual:?}")]
    KindMismatch {
        name: String,
        expected: PropertyKind,
        actual: PropertyKind,
    },
}

#[derive(Debug, Default)]
struct Inner {
    properties: Vec<Property>,
    index: HashMap<String, usize>,
}

impl Inner {
    fn position(&self, name: &str) -> Result<usize, RegistryError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownProperty(name.to_string()))
    }
}

/// Ordered, concurrently accessible map of property name to [`Property`]
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    inner: RwLock<Inner>,
    changed: Notify,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a property; names must be unique
    pub fn declare(&self, decl: PropertyDecl) -> Result<(), RegistryError> {
        if decl.initial.kind() != decl.kind {
            return Err(RegistryError::KindMismatch {
                name: decl.name,
                expected: decl.kind,
                actual: decl.initial.kind(),
            });
        }

        let mut inner = self.write();
        if inner.index.contains_key(&decl.name) {
            return Err(RegistryError::DuplicateName(decl.name));
        }

        debug!(property = %decl.name, kind = ?decl.kind, "Declared property");
        let position = inner.properties.len();
        inner.index.insert(decl.name.clone(), position);
        inner.properties.push(Property::from_decl(decl));
        drop(inner);

        self.changed.notify_one();
        Ok(())
    }

    /// Update the current value; returns whether it actually changed
    pub fn set(
        &self,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<bool, RegistryError> {
        let value = value.into();
        let mut inner = self.write();
        let position = inner.position(name)?;
        let property = &mut inner.properties[position];

        if property.kind != value.kind() {
            return Err(RegistryError::KindMismatch {
                name: name.to_string(),
                expected: property.kind,
                actual: value.kind(),
            });
        }

        let changed = property.current != value;
        let forced = std::mem::take(&mut property.force_notify);
        property.current = value;
        property.updated_at = Some(Utc::now());

        let notify = changed || forced;
        if notify {
            property.pending = true;
        }
        drop(inner);

        if notify {
            trace!(property = %name, changed, forced, "Queued change notification");
            self.changed.notify_one();
        }
        Ok(changed)
    }

    /// Current value of a property
    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        let inner = self.read();
        inner
            .index
            .get(name)
            .map(|&position| inner.properties[position].current.clone())
    }

    /// Full copy of a property including publish bookkeeping
    pub fn property(&self, name: &str) -> Option<Property> {
        let inner = self.read();
        inner
            .index
            .get(name)
            .map(|&position| inner.properties[position].clone())
    }

    /// Lazy, restartable view of (name, value) pairs in declaration order
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot { registry: self }
    }

    /// Record that `value` reached the broker for `name`
    ///
    /// The property stays pending when a newer write raced the publish.
    pub fn mark_published(&self, name: &str, value: &PropertyValue) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let position = inner.position(name)?;
        let property = &mut inner.properties[position];

        property.last_published = Some(value.clone());
        if property.current == *value {
            property.pending = false;
        }
        Ok(())
    }

    /// Properties with an outstanding change notification, in declaration order
    pub fn pending(&self) -> Vec<SnapshotEntry> {
        self.read()
            .properties
            .iter()
            .filter(|property| property.pending)
            .map(SnapshotEntry::from)
            .collect()
    }

    /// Drop every outstanding notification; returns how many were dropped
    pub fn discard_pending(&self) -> usize {
        let mut inner = self.write();
        let mut dropped = 0;
        for property in inner.properties.iter_mut().filter(|p| p.pending) {
            property.pending = false;
            dropped += 1;
        }
        dropped
    }

    /// Arm every property so its next write notifies even when unchanged
    pub fn request_replay(&self) {
        let mut inner = self.write();
        for property in inner.properties.iter_mut() {
            property.force_notify = true;
        }
    }

    /// Wait until at least one notification has been queued since the last call
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Schema of every property in declaration order
    pub fn descriptors(&self) -> Vec<PropertyDescriptor> {
        self.read()
            .properties
            .iter()
            .map(|property| PropertyDescriptor {
                name: property.name.clone(),
                display_name: property.display_name.clone(),
                kind: property.kind,
                unit: property.unit.clone(),
                retained: property.retained,
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_at(&self, position: usize) -> Option<SnapshotEntry> {
        self.read().properties.get(position).map(SnapshotEntry::from)
    }
}

/// One (name, value) pair read atomically from the registry
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    pub value: PropertyValue,
    /// Broker payload rendered with the property's precision
    pub payload: String,
}

impl From<&Property> for SnapshotEntry {
    fn from(property: &Property) -> Self {
        Self {
            name: property.name.clone(),
            value: property.current.clone(),
            payload: property.payload(),
        }
    }
}

/// Restartable view over the registry; each iteration reads live values
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    registry: &'a PropertyRegistry,
}

impl<'a> Snapshot<'a> {
    pub fn iter(&self) -> SnapshotIter<'a> {
        SnapshotIter {
            registry: self.registry,
            position: 0,
        }
    }
}

impl<'a> IntoIterator for &Snapshot<'a> {
    type Item = SnapshotEntry;
    type IntoIter = SnapshotIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator produced by [`Snapshot::iter`]
#[derive(Debug)]
pub struct SnapshotIter<'a> {
    registry: &'a PropertyRegistry,
    position: usize,
}

impl Iterator for SnapshotIter<'_> {
    type Item = SnapshotEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.registry.entry_at(self.position)?;
        self.position += 1;
        Some(entry)
    }
}
