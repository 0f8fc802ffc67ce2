//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising the daemon
//! without an MQTT broker, sensor hardware or a time-series database.

pub mod mocks;

pub use mocks::*;
