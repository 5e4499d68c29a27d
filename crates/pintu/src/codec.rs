//! Wire codecs for bus payloads
//!
//! Frames use a fixed binary header so large payloads are never copied
//! through a serializer:
//!
//! ```text
//! ┌────────────┬─────────────┬──────────┬─────────┬─────────┬───────────┐
//! │  sequence  │ captured_at │ encoding │  width  │ height  │  payload  │
//! │  (8 bytes) │  (8 bytes)  │ (1 byte) │ (4 B)   │ (4 B)   │   (var)   │
//! └────────────┴─────────────┴──────────┴─────────┴─────────┴───────────┘
//! ```
//!
//! All integers are big-endian. Every other message is MessagePack via
//! rmp-serde, encoded with field names so tagged enums round-trip.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Encoding, Frame, PipelineError, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD_SIZE, MAX_MESSAGE_SIZE};

/// Serialize a frame to bytes (header + payload)
pub fn frame_to_bytes(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());

    buf.put_u64(frame.sequence);
    buf.put_u64(frame.captured_at_us);
    buf.put_u8(frame.encoding.as_u8());
    buf.put_u32(frame.width);
    buf.put_u32(frame.height);

    buf.put_slice(&frame.payload);

    buf.freeze()
}

/// Deserialize a frame from bytes. The payload shares the input buffer.
pub fn frame_from_bytes(mut buf: Bytes) -> Result<Frame, PipelineError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(PipelineError::Codec(format!(
            "buffer too small for frame header: {} < {}",
            buf.len(),
            FRAME_HEADER_SIZE
        )));
    }
    if buf.len() - FRAME_HEADER_SIZE > MAX_FRAME_PAYLOAD_SIZE {
        return Err(PipelineError::Codec(format!(
            "frame payload exceeds maximum: {} > {}",
            buf.len() - FRAME_HEADER_SIZE,
            MAX_FRAME_PAYLOAD_SIZE
        )));
    }

    let sequence = buf.get_u64();
    let captured_at_us = buf.get_u64();
    let encoding = Encoding::from(buf.get_u8());
    let width = buf.get_u32();
    let height = buf.get_u32();

    Ok(Frame {
        sequence,
        captured_at_us,
        encoding,
        width,
        height,
        payload: buf,
    })
}

/// Encode a message as MessagePack
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, PipelineError> {
    let bytes = rmp_serde::to_vec_named(message)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(PipelineError::Codec(format!(
            "message too large: {} > {}",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(Bytes::from(bytes))
}

/// Decode a MessagePack message
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, PipelineError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(PipelineError::Codec(format!(
            "message too large: {} > {}",
            data.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(rmp_serde::from_slice(data)?)
}
