//! Consistent Overhead Byte Stuffing.
//!
//! Lite sensors and binary recordings use 0x00 as a frame delimiter, so every
//! payload is stuffed so that it contains no zero byte. The delimiter itself
//! is not produced by [`encode`]; writers append it after each frame and
//! readers split on it (see [`FrameSplitter`]) before calling [`decode`].
//!
//! ```text
//!  payload:  11 22 00 33
//!  encoded:  03 11 22 02 33
//!            ^^       ^^   code = run length + 1, implied zero between runs
//! ```

use crate::error::ParseError;

/// Frame delimiter used on the wire and in recordings
pub const DELIMITER: u8 = 0x00;

/// Longest run of non-zero bytes a single code byte can describe
pub const MAX_RUN: usize = 254;

/// Encode `data` so that the result contains no zero byte.
///
/// Empty input encodes to empty output.
pub fn encode(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / MAX_RUN + 2);
    let mut code_pos = 0;
    out.push(0); // placeholder for the first code byte
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_pos] = code;
            code_pos = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_pos] = code;
                code_pos = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_pos] = code;

    // A full 254-byte run at the very end leaves a dangling empty run
    // that would decode to an extra zero byte.
    if code == 1 && data.last() != Some(&0) {
        out.pop();
    }

    out
}

/// Decode a single COBS frame (without its trailing delimiter).
///
/// A code byte that references more bytes than remain, or a zero byte
/// anywhere in the frame, is rejected.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(frame.len());
    let mut pos = 0;

    while pos < frame.len() {
        let code = frame[pos];
        if code == DELIMITER {
            return Err(ParseError::UnexpectedZero(pos));
        }

        let run = code as usize - 1;
        let start = pos + 1;
        let available = frame.len() - start;
        if run > available {
            return Err(ParseError::TruncatedFrame {
                offset: pos,
                needed: run,
                available,
            });
        }

        let chunk = &frame[start..start + run];
        if let Some(zero) = chunk.iter().position(|&b| b == 0) {
            return Err(ParseError::UnexpectedZero(start + zero));
        }
        out.extend_from_slice(chunk);
        pos = start + run;

        if code != 0xFF && pos < frame.len() {
            out.push(0);
        }
    }

    Ok(out)
}

/// Encode `data` and append the frame delimiter.
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut out = encode(data);
    out.push(DELIMITER);
    out
}

/// Splits a byte stream into delimiter-terminated frames.
///
/// Bytes after the last delimiter are kept until more data arrives.
#[derive(Debug, Default, Clone)]
pub struct FrameSplitter {
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every complete, non-empty frame they close.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in data {
            if byte == DELIMITER {
                if !self.pending.is_empty() {
                    frames.push(std::mem::take(&mut self.pending));
                }
            } else {
                self.pending.push(byte);
            }
        }
        frames
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Return the unterminated tail, if any, and reset.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let encoded = encode(data);
        assert!(
            !encoded.contains(&0),
            "encoded output contains zero for input len {}",
            data.len()
        );
        assert_eq!(decode(&encoded).unwrap(), data, "len {}", data.len());
    }

    #[test]
    fn test_empty() {
        assert!(encode(&[]).is_empty());
        assert_eq!(decode(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(encode(&[0x00, 0x00]), vec![0x01, 0x01, 0x01]);
        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33]), vec![0x03, 0x11, 0x22, 0x02, 0x33]);
        assert_eq!(encode(&[0x11, 0x22, 0x33, 0x44]), vec![0x05, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(encode(&[0x11, 0x00, 0x00, 0x00]), vec![0x02, 0x11, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_no_zero_gets_leading_code() {
        let encoded = encode(b"abc");
        assert_eq!(encoded[0], 4);
        assert_eq!(&encoded[1..], b"abc");
    }

    #[test]
    fn test_long_runs_split() {
        let data: Vec<u8> = (0..254).map(|i| (i % 255 + 1) as u8).collect();
        let encoded = encode(&data);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(encoded.len(), 255);
        roundtrip(&data);

        let data: Vec<u8> = (0..255).map(|i| (i % 255 + 1) as u8).collect();
        let encoded = encode(&data);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(encoded[255], 0x02);
        roundtrip(&data);
    }

    #[test]
    fn test_roundtrip_lengths() {
        for len in [0usize, 1, 253, 254, 255, 256, 500] {
            let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            roundtrip(&data);
            let dense: Vec<u8> = (0..len).map(|i| (i % 255 + 1) as u8).collect();
            roundtrip(&dense);
            roundtrip(&vec![0u8; len]);
        }
    }

    #[test]
    fn test_trailing_zero_after_full_run() {
        let mut data: Vec<u8> = vec![0x42; 254];
        data.push(0);
        roundtrip(&data);
    }

    #[test]
    fn test_decode_rejects_truncated_code() {
        assert!(matches!(
            decode(&[0x05, 0x11, 0x22]),
            Err(ParseError::TruncatedFrame { offset: 0, needed: 4, available: 2 })
        ));
    }

    #[test]
    fn test_decode_rejects_embedded_zero() {
        assert!(matches!(decode(&[0x03, 0x11, 0x00]), Err(ParseError::UnexpectedZero(2))));
        assert!(matches!(decode(&[0x00]), Err(ParseError::UnexpectedZero(0))));
    }

    #[test]
    fn test_frame_splitter() {
        let mut splitter = FrameSplitter::new();
        let mut stream = encode_frame(b"one");
        stream.extend(encode_frame(&[1, 0, 2]));
        stream.push(0); // empty frame is skipped
        let (a, b) = stream.split_at(5);

        let mut frames = splitter.push(a);
        assert!(frames.is_empty() || frames.len() == 1);
        frames.extend(splitter.push(b));
        assert_eq!(frames.len(), 2);
        assert_eq!(decode(&frames[0]).unwrap(), b"one");
        assert_eq!(decode(&frames[1]).unwrap(), vec![1, 0, 2]);
        assert_eq!(splitter.pending_len(), 0);

        splitter.push(&[0x03, 0x11]);
        assert_eq!(splitter.take_remainder(), Some(vec![0x03, 0x11]));
        assert_eq!(splitter.take_remainder(), None);
    }
}
