//! Error types for frame and packet decoding

use thiserror::Error;

/// Errors that can occur when decoding sensor notifications or recorded frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Packet is too short to contain required data
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Packet has a fixed size and this one doesn't match it
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A COBS code byte points past the end of the frame
    #[error("Truncated frame: code at offset {offset} needs {needed} bytes, {available} remain")]
    TruncatedFrame {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A zero byte appeared inside a COBS frame
    #[error("Unexpected zero byte at offset {0}")]
    UnexpectedZero(usize),

    /// Failed to deserialize the protobuf message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// The event carries no content at all
    #[error("Event has no content")]
    EmptyEvent,

    /// Invalid UTF-8 in string field
    #[error("Invalid string encoding")]
    InvalidString,
}

impl From<protobuf::Error> for ParseError {
    fn from(e: protobuf::Error) -> Self {
        ParseError::DeserializationFailed(e.to_string())
    }
}
