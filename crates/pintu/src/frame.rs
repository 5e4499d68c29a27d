//! Frame types for captured still images

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Image encoding of a frame payload.
///
/// The `Unknown` variant keeps the codec forward compatible: frames with an
/// unrecognized encoding byte are accepted and carried without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Uncompressed pixels, layout agreed out of band
    Raw,
    /// JPEG still
    Jpeg,
    /// PNG still
    Png,
    /// Forward-compatible: unknown encodings pass through untouched
    Unknown(u8),
}

impl Encoding {
    /// Convert to the wire-format byte value.
    pub fn as_u8(&self) -> u8 {
        match self {
            Encoding::Raw => 0,
            Encoding::Jpeg => 1,
            Encoding::Png => 2,
            Encoding::Unknown(v) => *v,
        }
    }

    /// MIME type used when shipping the payload to an inference service.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Encoding::Jpeg => "image/jpeg",
            Encoding::Png => "image/png",
            Encoding::Raw | Encoding::Unknown(_) => "application/octet-stream",
        }
    }
}

impl From<u8> for Encoding {
    fn from(value: u8) -> Self {
        match value {
            0 => Encoding::Raw,
            1 => Encoding::Jpeg,
            2 => Encoding::Png,
            v => Encoding::Unknown(v),
        }
    }
}

/// A single captured image.
///
/// `sequence` is assigned by the frame source at acquisition time and is
/// strictly increasing within one capture session. Frames dropped before
/// publication therefore show up downstream as sequence gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Per-session sequence number
    pub sequence: u64,
    /// Capture time in microseconds since the Unix epoch
    pub captured_at_us: u64,
    /// Payload encoding
    pub encoding: Encoding,
    /// Image width in pixels (0 if unknown)
    pub width: u32,
    /// Image height in pixels (0 if unknown)
    pub height: u32,
    /// Encoded image bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame. Sequence and capture time are stamped by the source.
    pub fn new(encoding: Encoding, width: u32, height: u32, payload: Bytes) -> Self {
        Self {
            sequence: 0,
            captured_at_us: 0,
            encoding,
            width,
            height,
            payload,
        }
    }

    /// Set the sequence and return self (builder pattern)
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set the capture time and return self (builder pattern)
    pub fn with_timestamp(mut self, captured_at_us: u64) -> Self {
        self.captured_at_us = captured_at_us;
        self
    }

    /// Payload size, used for buffer byte budgets
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_conversion() {
        assert_eq!(Encoding::from(0), Encoding::Raw);
        assert_eq!(Encoding::from(1), Encoding::Jpeg);
        assert_eq!(Encoding::from(2), Encoding::Png);
        assert_eq!(Encoding::from(9), Encoding::Unknown(9));
        assert_eq!(Encoding::Unknown(200).as_u8(), 200);
        assert_eq!(Encoding::Png.as_u8(), 2);
    }

    #[test]
    fn test_frame_builder() {
        let frame = Frame::new(Encoding::Jpeg, 640, 480, Bytes::from_static(b"\xff\xd8"))
            .with_sequence(42)
            .with_timestamp(1_000_000);

        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.captured_at_us, 1_000_000);
        assert_eq!(frame.size_bytes(), 2);
        assert_eq!(frame.encoding.mime_type(), "image/jpeg");
    }
}
