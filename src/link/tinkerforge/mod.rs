//! Tinkerforge Brick Daemon link
//!
//! - [`codec`] - Pure packet framing, enumeration and value decoding
//! - [`connection`] - TCP session with request/response matching

pub mod codec;
pub mod connection;

pub use connection::TinkerforgeLink;
