//! OpenBikeSensor Classic protocol (fixed-size BLE packets)
//!
//! The Classic sensor notifies an 8-byte packet on the distance
//! characteristic for every measurement cycle, and a packet of the same
//! layout on the button characteristic when the operator confirms an
//! overtake. Only the arrival of a button notification matters; the
//! distances it confirms are the ones from the last distance packet.
//!
//! ```text
//!  0        4        6        8
//!  +--------+--------+--------+
//!  | clock  | left   | right  |   all little-endian
//!  | u32 ms | u16 cm | u16 cm |   0xFFFF = no reading
//!  +--------+--------+--------+
//! ```

use serde::{Deserialize, Serialize};

use super::c_string;
use crate::error::ParseError;

/// Size of a distance packet
pub const PACKET_LEN: usize = 8;

/// Distance value meaning "no echo"
pub const NO_READING: u16 = 0xFFFF;

/// Microseconds of ultrasonic flight time per centimeter of distance
pub const FLIGHT_TIME_FACTOR: u32 = 58;

/// Largest distance the sensor can report, in centimeters
pub const MAX_DISTANCE_CM: u16 = 320;

/// Flight times above this are treated as invalid by analysis tooling
pub const MAX_VALID_FLIGHT_TIME_US: u32 = MAX_DISTANCE_CM as u32 * FLIGHT_TIME_FACTOR;

/// Parsed distance packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassicPacket {
    /// Sensor clock in milliseconds since power-on (wraps)
    pub clock_ms: u32,
    pub left_cm: Option<u16>,
    pub right_cm: Option<u16>,
}

impl ClassicPacket {
    /// Exchange left and right readings. Applying it twice is a no-op.
    pub fn swapped(self) -> Self {
        Self {
            clock_ms: self.clock_ms,
            left_cm: self.right_cm,
            right_cm: self.left_cm,
        }
    }

    /// Wire representation (emulator and tests).
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[0..4].copy_from_slice(&self.clock_ms.to_le_bytes());
        buf[4..6].copy_from_slice(&self.left_cm.unwrap_or(NO_READING).to_le_bytes());
        buf[6..8].copy_from_slice(&self.right_cm.unwrap_or(NO_READING).to_le_bytes());
        buf
    }
}

/// Parse a distance (or button) packet. Anything but 8 bytes is rejected.
pub fn parse_packet(data: &[u8]) -> Result<ClassicPacket, ParseError> {
    if data.len() != PACKET_LEN {
        return Err(ParseError::LengthMismatch {
            expected: PACKET_LEN,
            actual: data.len(),
        });
    }

    let clock_ms = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let left = u16::from_le_bytes([data[4], data[5]]);
    let right = u16::from_le_bytes([data[6], data[7]]);

    Ok(ClassicPacket {
        clock_ms,
        left_cm: reading(left),
        right_cm: reading(right),
    })
}

fn reading(raw: u16) -> Option<u16> {
    (raw != NO_READING).then_some(raw)
}

/// Handlebar offsets stored on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassicOffsets {
    pub left_cm: u16,
    pub right_cm: u16,
}

impl ClassicOffsets {
    /// Both sides set to half the handlebar width.
    pub fn from_handlebar_width(width_cm: u16) -> Self {
        Self {
            left_cm: width_cm / 2,
            right_cm: width_cm / 2,
        }
    }

    pub fn swapped(self) -> Self {
        Self {
            left_cm: self.right_cm,
            right_cm: self.left_cm,
        }
    }
}

/// Parse the offset characteristic: u16 LE left, u16 LE right.
pub fn parse_offsets(data: &[u8]) -> Result<ClassicOffsets, ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort {
            expected: 4,
            actual: data.len(),
        });
    }
    Ok(ClassicOffsets {
        left_cm: u16::from_le_bytes([data[0], data[1]]),
        right_cm: u16::from_le_bytes([data[2], data[3]]),
    })
}

/// Parse the device id characteristic (NUL-terminated or plain text).
pub fn parse_device_id(data: &[u8]) -> Result<String, ParseError> {
    let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    if std::str::from_utf8(&data[..null_pos]).is_err() {
        return Err(ParseError::InvalidString);
    }
    c_string(data).ok_or(ParseError::TooShort {
        expected: 1,
        actual: 0,
    })
}

/// Ultrasonic flight time for a raw distance.
pub fn flight_time_us(raw_cm: u16) -> u32 {
    u32::from(raw_cm) * FLIGHT_TIME_FACTOR
}
