//! Property values and declarations
//!
//! A property is a named, typed, retained value. Names of the form
//! `<node>/<property>` belong to a node; names starting with `$` are
//! device-level attributes such as `$state`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of value a property carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Numeric,
    Text,
}

impl PropertyKind {
    /// Homie `$datatype` for this kind
    pub fn datatype(&self) -> &'static str {
        match self {
            PropertyKind::Numeric => "float",
            PropertyKind::Text => "string",
        }
    }
}

/// Current value of a property
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Number(_) => PropertyKind::Numeric,
            PropertyValue::Text(_) => PropertyKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(value) => Some(*value),
            PropertyValue::Text(_) => None,
        }
    }

    /// UTF-8 payload for the broker, honouring an optional decimal precision
    pub fn to_payload(&self, precision: Option<u8>) -> String {
        match (self, precision) {
            (PropertyValue::Number(value), Some(digits)) => {
                format!("{:.*}", usize::from(digits), value)
            }
            (PropertyValue::Number(value), None) => value.to_string(),
            (PropertyValue::Text(text), _) => text.clone(),
        }
    }
}

// NaN compares equal to NaN so a sensor stuck on NaN does not republish every tick.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Number(a), PropertyValue::Number(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (PropertyValue::Text(a), PropertyValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload(None))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Declaration used to register a property at startup
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDecl {
    pub name: String,
    pub display_name: String,
    pub kind: PropertyKind,
    pub unit: Option<String>,
    pub precision: Option<u8>,
    pub initial: PropertyValue,
}

impl PropertyDecl {
    pub fn numeric(name: impl Into<String>, display_name: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind: PropertyKind::Numeric,
            unit: None,
            precision: None,
            initial: PropertyValue::Number(initial),
        }
    }

    pub fn text(
        name: impl Into<String>,
        display_name: impl Into<String>,
        initial: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind: PropertyKind::Text,
            unit: None,
            precision: None,
            initial: PropertyValue::Text(initial.into()),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }
}

/// Registered property with its publish bookkeeping
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub display_name: String,
    pub kind: PropertyKind,
    pub unit: Option<String>,
    pub precision: Option<u8>,
    pub retained: bool,
    pub current: PropertyValue,
    pub last_published: Option<PropertyValue>,
    /// Time of the last `set`, `None` while only the initial value is known
    pub updated_at: Option<DateTime<Utc>>,
    /// A change notification is outstanding for this property
    pub(crate) pending: bool,
    /// Next write notifies even when the value is unchanged
    pub(crate) force_notify: bool,
}

impl Property {
    pub(crate) fn from_decl(decl: PropertyDecl) -> Self {
        Self {
            name: decl.name,
            display_name: decl.display_name,
            kind: decl.kind,
            unit: decl.unit,
            precision: decl.precision,
            retained: true,
            current: decl.initial,
            last_published: None,
            updated_at: None,
            pending: true,
            force_notify: false,
        }
    }

    /// Node this property belongs to, `None` for device-level attributes
    pub fn node(&self) -> Option<&str> {
        node_of(&self.name)
    }

    pub fn payload(&self) -> String {
        self.current.to_payload(self.precision)
    }

    pub fn is_published(&self) -> bool {
        self.last_published.as_ref() == Some(&self.current)
    }
}

/// Node part of a `<node>/<property>` name
pub fn node_of(name: &str) -> Option<&str> {
    if name.starts_with('$') {
        return None;
    }
    name.split_once('/').map(|(node, _)| node)
}

/// Schema view of a property, used for Homie metadata
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub display_name: String,
    pub kind: PropertyKind,
    pub unit: Option<String>,
    pub retained: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_payload_verbatim() {
        assert_eq!(PropertyValue::Number(21.5).to_payload(None), "21.5");
        assert_eq!(PropertyValue::Number(3.0).to_payload(None), "3");
    }

    #[test]
    fn test_numeric_payload_with_precision() {
        assert_eq!(PropertyValue::Number(47.256).to_payload(Some(1)), "47.3");
        assert_eq!(PropertyValue::Number(1013.0).to_payload(Some(0)), "1013");
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(PropertyValue::Number(1.0), PropertyValue::Number(1.0));
        assert_eq!(
            PropertyValue::Number(f64::NAN),
            PropertyValue::Number(f64::NAN)
        );
        assert_ne!(PropertyValue::Number(1.0), PropertyValue::Text("1".into()));
        assert_eq!(PropertyValue::from("Healthy"), PropertyValue::from("Healthy"));
    }

    #[test]
    fn test_node_of() {
        assert_eq!(node_of("ambient/temperature"), Some("ambient"));
        assert_eq!(node_of("$state"), None);
        assert_eq!(node_of("flat"), None);
    }

    #[test]
    fn test_decl_builders() {
        let decl = PropertyDecl::numeric("system/uptime", "Uptime", 0.0)
            .with_unit("h")
            .with_precision(2);
        assert_eq!(decl.kind, PropertyKind::Numeric);
        assert_eq!(decl.unit.as_deref(), Some("h"));
        assert_eq!(decl.precision, Some(2));

        let text = PropertyDecl::text("system/status", "Status", "Healthy");
        assert_eq!(text.initial, PropertyValue::from("Healthy"));
    }
}
