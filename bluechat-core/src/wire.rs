//! Framing: fixed 25-byte big-endian header + chunk payload, CRC-32 over the payload.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::integrity;
use crate::protocol::{MessageType, HEADER_LEN, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Decoded frame header. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub message_id: u32,
    pub timestamp: u64,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub payload_length: u16,
    pub flags: u8,
    pub crc32: u32,
}

/// On-wire layout; bincode with fixed-width big-endian integers emits exactly `HEADER_LEN` bytes.
#[derive(Serialize, Deserialize)]
struct RawHeader {
    version: u8,
    message_type: u8,
    message_id: u32,
    timestamp: u64,
    chunk_index: u16,
    total_chunks: u16,
    payload_length: u16,
    flags: u8,
    crc32: u32,
}

fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode a header into its 25-byte wire form.
pub fn encode_header(header: &FrameHeader) -> Result<Vec<u8>, FrameEncodeError> {
    let raw = RawHeader {
        version: header.version,
        message_type: header.message_type.as_byte(),
        message_id: header.message_id,
        timestamp: header.timestamp,
        chunk_index: header.chunk_index,
        total_chunks: header.total_chunks,
        payload_length: header.payload_length,
        flags: header.flags,
        crc32: header.crc32,
    };
    let out = header_options().serialize(&raw)?;
    debug_assert_eq!(out.len(), HEADER_LEN);
    Ok(out)
}

/// Decode the header at the front of `bytes`. Trailing bytes are ignored.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::TooShort(bytes.len()));
    }
    let raw: RawHeader = header_options().deserialize(&bytes[..HEADER_LEN])?;
    let message_type =
        MessageType::try_from(raw.message_type).map_err(FrameDecodeError::UnknownMessageType)?;
    Ok(FrameHeader {
        version: raw.version,
        message_type,
        message_id: raw.message_id,
        timestamp: raw.timestamp,
        chunk_index: raw.chunk_index,
        total_chunks: raw.total_chunks,
        payload_length: raw.payload_length,
        flags: raw.flags,
        crc32: raw.crc32,
    })
}

/// One on-wire unit: header plus the chunk payload it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame for one chunk, filling in version, length and checksum.
    pub fn new(
        message_id: u32,
        message_type: MessageType,
        timestamp: u64,
        chunk_index: u16,
        total_chunks: u16,
        payload: Vec<u8>,
    ) -> Result<Self, FrameEncodeError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameEncodeError::TooLarge(payload.len()));
        }
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            message_type,
            message_id,
            timestamp,
            chunk_index,
            total_chunks,
            payload_length: payload.len() as u16,
            flags: 0,
            crc32: integrity::checksum(&payload),
        };
        Ok(Self { header, payload })
    }

    /// Header bytes followed by payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut out = encode_header(&self.header)?;
        out.reserve(self.payload.len());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Decode and verify one frame. The payload is exactly `payload_length` bytes;
/// anything after it is ignored.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let header = decode_header(bytes)?;
    let len = header.payload_length as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameDecodeError::PayloadTooLarge(len));
    }
    if header.chunk_index >= header.total_chunks {
        return Err(FrameDecodeError::ChunkIndexOutOfRange {
            index: header.chunk_index,
            total: header.total_chunks,
        });
    }
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameDecodeError::Truncated {
            expected: HEADER_LEN + len,
            actual: bytes.len(),
        });
    }
    let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
    let actual = integrity::checksum(&payload);
    if actual != header.crc32 {
        return Err(FrameDecodeError::Checksum {
            expected: header.crc32,
            actual,
        });
    }
    Ok(Frame { header, payload })
}

/// Error encoding a frame (payload over the per-frame budget, or header encoding).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("payload of {0} bytes exceeds frame budget")]
    TooLarge(usize),
    #[error("message needs more than 65535 chunks")]
    TooManyChunks,
}

/// Error decoding a frame. `Checksum` is an integrity failure; the rest are format failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame of {0} bytes is shorter than the header")]
    TooShort(usize),
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("declared payload of {0} bytes exceeds frame budget")]
    PayloadTooLarge(usize),
    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkIndexOutOfRange { index: u16, total: u16 },
    #[error("frame truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("checksum mismatch: header 0x{expected:08x}, payload 0x{actual:08x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

impl FrameDecodeError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, FrameDecodeError::Checksum { .. })
    }
}
