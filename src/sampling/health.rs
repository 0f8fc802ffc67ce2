//! Consecutive-failure tracking and aggregate health status

use crate::link::DeviceHandle;
use std::collections::HashMap;
use std::fmt;

/// Aggregate health of the monitored devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Healthy,
    Alert,
}

impl SystemStatus {
    /// Homie `$state` value for this status
    pub fn device_state(&self) -> &'static str {
        match self {
            SystemStatus::Healthy => "ready",
            SystemStatus::Alert => "alert",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, SystemStatus::Healthy)
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemStatus::Healthy => f.write_str("Healthy"),
            SystemStatus::Alert => f.write_str("Alert"),
        }
    }
}

/// Per-handle consecutive failure counts
///
/// Counts are keyed by the full handle, so a device rebound in a new link
/// generation starts from zero.
#[derive(Debug)]
pub struct HealthTracker {
    threshold: u32,
    failures: HashMap<DeviceHandle, u32>,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Reset the count of `handle`, returning the previous count
    pub fn record_success(&mut self, handle: &DeviceHandle) -> u32 {
        self.failures.insert(handle.clone(), 0).unwrap_or(0)
    }

    /// Increment the count of `handle`, returning the new count
    pub fn record_failure(&mut self, handle: &DeviceHandle) -> u32 {
        let count = self.failures.entry(handle.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn consecutive_failures(&self, handle: &DeviceHandle) -> u32 {
        self.failures.get(handle).copied().unwrap_or(0)
    }

    /// Forget handles that are no longer bound
    pub fn retain_current(&mut self, handles: &[DeviceHandle]) {
        self.failures.retain(|handle, _| handles.contains(handle));
    }

    /// Alert iff some tracked handle failed more than `threshold` times in a row
    pub fn evaluate(&self) -> SystemStatus {
        if self.failures.values().any(|&count| count > self.threshold) {
            SystemStatus::Alert
        } else {
            SystemStatus::Healthy
        }
    }
}
