//! InfluxDB line protocol points

use chrono::{DateTime, Utc};
use std::fmt::Write;

/// One line-protocol record with float fields
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, f64)>,
    timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Non-finite values are dropped; line protocol cannot carry them
    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        if value.is_finite() {
            self.fields.push((key.into(), value));
        }
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Render as `measurement,tag=v field=1.5 <ns>`
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            let separator = if i == 0 { ' ' } else { ',' };
            let _ = write!(line, "{separator}{}={value}", escape(key, &[',', '=', ' ']));
        }

        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros() * 1000);
        let _ = write!(line, " {nanos}");
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
