//! Sensor wire protocols.
//!
//! This module contains the notification parsers for both sensor generations.
//! All functions are pure (no I/O).
//!
//! # Structure
//!
//! - [`lite`] - protobuf `Event` messages, COBS framed
//! - [`classic`] - fixed 8-byte distance packets and the read-once
//!   offset and id characteristics
//!
//! # Example
//!
//! ```rust
//! use obs_core::protocol::classic;
//!
//! let packet = classic::parse_packet(&[0x10, 0x27, 0, 0, 0x96, 0, 0xff, 0xff]).unwrap();
//! assert_eq!(packet.left_cm, Some(150));
//! assert_eq!(packet.right_cm, None);
//! ```

pub mod classic;
pub mod lite;

/// Exchange the two distance source ids. Any other id passes through.
pub fn swap_source_id(id: u32) -> u32 {
    match id {
        1 => 2,
        2 => 1,
        other => other,
    }
}

/// Helper function to extract a null-terminated C string from bytes
pub fn c_string(bytes: &[u8]) -> Option<String> {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..null_pos])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
