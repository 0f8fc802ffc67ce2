//! Brick Daemon TCP/IP packet codec
//!
//! Every packet starts with an 8-byte header:
//!
//! | bytes | field                                                    |
//! |-------|----------------------------------------------------------|
//! | 0..4  | UID, u32 little endian                                   |
//! | 4     | total packet length including header                     |
//! | 5     | function id                                              |
//! | 6     | sequence number (bits 4-7), response expected (bit 3)    |
//! | 7     | error code (bits 6-7)                                    |
//!
//! Multi-byte payload fields are little endian.

use crate::link::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = 80;

/// Broadcast enumerate request, sent with UID 0
pub const FUNCTION_ENUMERATE: u8 = 254;
/// Enumerate callback carrying one device announcement
pub const CALLBACK_ENUMERATE: u8 = 253;
/// Air Quality Bricklet `get_all_values`
pub const FUNCTION_AIR_QUALITY_GET_ALL_VALUES: u8 = 1;

pub const ENUMERATE_PAYLOAD_LEN: usize = 26;
pub const AIR_QUALITY_ALL_VALUES_LEN: usize = 17;

const BASE58_ALPHABET: &[u8] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub uid: u32,
    pub length: u8,
    pub function_id: u8,
    pub sequence: u8,
    pub response_expected: bool,
    pub error_code: u8,
}

impl Header {
    /// Callbacks carry sequence number 0
    pub fn is_callback(&self) -> bool {
        self.sequence == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

/// Serialize a request packet
pub fn encode_request(
    uid: u32,
    function_id: u8,
    sequence: u8,
    response_expected: bool,
    payload: &[u8],
) -> BytesMut {
    let length = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u32_le(uid);
    buf.put_u8(length as u8);
    buf.put_u8(function_id);
    buf.put_u8(((sequence & 0x0F) << 4) | (u8::from(response_expected) << 3));
    buf.put_u8(0);
    buf.put_slice(payload);
    buf
}

/// Take one complete packet off the front of `buf`, if present
pub fn decode_packet(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let length = buf[4];
    if (length as usize) < HEADER_LEN || length as usize > MAX_PACKET_LEN {
        return Err(CodecError::InvalidLength(length));
    }
    if buf.len() < length as usize {
        return Ok(None);
    }

    let mut frame = buf.split_to(length as usize).freeze();
    let uid = frame.get_u32_le();
    let length = frame.get_u8();
    let function_id = frame.get_u8();
    let sequence_byte = frame.get_u8();
    let flags = frame.get_u8();

    Ok(Some(Packet {
        header: Header {
            uid,
            length,
            function_id,
            sequence: sequence_byte >> 4,
            response_expected: sequence_byte & 0x08 != 0,
            error_code: flags >> 6,
        },
        payload: frame,
    }))
}

/// How an enumerate callback describes the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationType {
    Available,
    Connected,
    Disconnected,
    Unknown(u8),
}

impl From<u8> for EnumerationType {
    fn from(value: u8) -> Self {
        match value {
            0 => EnumerationType::Available,
            1 => EnumerationType::Connected,
            2 => EnumerationType::Disconnected,
            other => EnumerationType::Unknown(other),
        }
    }
}

/// Payload of the enumerate callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    pub uid: String,
    pub connected_uid: String,
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
    pub enumeration_type: EnumerationType,
}

impl Enumeration {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        ensure_len(payload, ENUMERATE_PAYLOAD_LEN)?;

        let uid = take_string(&mut payload, 8);
        let connected_uid = take_string(&mut payload, 8);
        let position = char::from(payload.get_u8());
        let mut hardware_version = [0u8; 3];
        payload.copy_to_slice(&mut hardware_version);
        let mut firmware_version = [0u8; 3];
        payload.copy_to_slice(&mut firmware_version);
        let device_identifier = payload.get_u16_le();
        let enumeration_type = EnumerationType::from(payload.get_u8());

        Ok(Self {
            uid,
            connected_uid,
            position,
            hardware_version,
            firmware_version,
            device_identifier,
            enumeration_type,
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENUMERATE_PAYLOAD_LEN);
        put_string(&mut buf, &self.uid, 8);
        put_string(&mut buf, &self.connected_uid, 8);
        buf.put_u8(self.position as u8);
        buf.put_slice(&self.hardware_version);
        buf.put_slice(&self.firmware_version);
        buf.put_u16_le(self.device_identifier);
        buf.put_u8(match self.enumeration_type {
            EnumerationType::Available => 0,
            EnumerationType::Connected => 1,
            EnumerationType::Disconnected => 2,
            EnumerationType::Unknown(value) => value,
        });
        buf
    }
}

/// Response of Air Quality `get_all_values`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirQualityValues {
    pub iaq_index: i32,
    pub iaq_accuracy: u8,
    /// °C
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
    /// hPa
    pub air_pressure: f64,
}

impl AirQualityValues {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        ensure_len(payload, AIR_QUALITY_ALL_VALUES_LEN)?;

        let iaq_index = payload.get_i32_le();
        let iaq_accuracy = payload.get_u8();
        let temperature = f64::from(payload.get_i32_le()) / 100.0;
        let humidity = f64::from(payload.get_i32_le()) / 100.0;
        let air_pressure = f64::from(payload.get_i32_le()) / 100.0;

        Ok(Self {
            iaq_index,
            iaq_accuracy,
            temperature,
            humidity,
            air_pressure,
        })
    }
}

fn ensure_len(payload: &[u8], needed: usize) -> Result<(), CodecError> {
    if payload.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn take_string(payload: &mut &[u8], len: usize) -> String {
    let raw = &payload[..len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    let value = String::from_utf8_lossy(&raw[..end]).into_owned();
    payload.advance(len);
    value
}

#[cfg(test)]
fn put_string(buf: &mut Vec<u8>, value: &str, len: usize) {
    let bytes = value.as_bytes();
    let used = bytes.len().min(len);
    buf.put_slice(&bytes[..used]);
    buf.put_bytes(0, len - used);
}

/// Decode a base58 UID string to the 32-bit UID used on the wire
pub fn base58_decode(encoded: &str) -> Result<u32, CodecError> {
    let mut value: u64 = 0;
    for c in encoded.bytes() {
        let digit = BASE58_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| CodecError::InvalidUid(encoded.to_string()))?;
        value = value
            .checked_mul(58)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| CodecError::InvalidUid(encoded.to_string()))?;
    }
    if encoded.is_empty() {
        return Err(CodecError::InvalidUid(encoded.to_string()));
    }

    if value > u64::from(u32::MAX) {
        // 64-bit UIDs are folded into 32 bits the same way the bindings do
        let low = value & 0xFFFF_FFFF;
        let high = value >> 32;
        let folded = (low & 0x0000_0FFF)
            | ((low & 0x0F00_0000) >> 12)
            | ((high & 0x0000_003F) << 16)
            | ((high & 0x000F_0000) << 6)
            | ((high & 0x3F00_0000) << 2);
        return Ok(folded as u32);
    }

    Ok(value as u32)
}

pub fn base58_encode(mut value: u32) -> String {
    if value == 0 {
        return "1".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE58_ALPHABET[(value % 58) as usize]);
        value /= 58;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
