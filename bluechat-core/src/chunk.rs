//! Chunk manager: split an outbound message into frames, reassemble inbound chunks.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::protocol::{MessageType, HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::wire::{Frame, FrameEncodeError, FrameHeader};

/// Per-frame payload budget for a link MTU, clamped to `[1, MAX_PAYLOAD_SIZE]`.
pub fn chunk_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_LEN).clamp(1, MAX_PAYLOAD_SIZE)
}

/// Number of chunks a payload of `len` bytes occupies. Never zero.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1)).max(1)
}

/// Split a type-encoded payload into frames in chunk order. Every frame shares
/// `message_id` and `message_type`; each takes a fresh timestamp from `clock`.
/// An empty payload still yields one empty frame.
pub fn split_into_frames(
    message_id: u32,
    message_type: MessageType,
    payload: &[u8],
    chunk_size: usize,
    clock: &dyn Fn() -> u64,
) -> Result<Vec<Frame>, FrameEncodeError> {
    let size = chunk_size.clamp(1, MAX_PAYLOAD_SIZE);
    let total = chunk_count(payload.len(), size);
    let total = u16::try_from(total).map_err(|_| FrameEncodeError::TooManyChunks)?;

    if payload.is_empty() {
        return Ok(vec![Frame::new(
            message_id,
            message_type,
            clock(),
            0,
            1,
            Vec::new(),
        )?]);
    }

    let mut frames = Vec::with_capacity(total as usize);
    for (index, chunk) in payload.chunks(size).enumerate() {
        frames.push(Frame::new(
            message_id,
            message_type,
            clock(),
            index as u16,
            total,
            chunk.to_vec(),
        )?);
    }
    Ok(frames)
}

/// A fully reassembled message payload, still type-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub message_id: u32,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

/// Outcome of feeding one chunk to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    Complete(CompleteMessage),
    Incomplete,
}

/// Chunks received so far for one message id.
#[derive(Debug)]
struct ReassemblyBuffer {
    total_chunks: u16,
    message_type: MessageType,
    chunks: HashMap<u16, Vec<u8>>,
}

impl ReassemblyBuffer {
    fn new(total_chunks: u16, message_type: MessageType) -> Self {
        Self {
            total_chunks,
            message_type,
            chunks: HashMap::new(),
        }
    }

    /// Only indices below `total_chunks` are ever stored, so a count match means
    /// every index is present.
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks as usize
    }

    /// Concatenate chunks 0..total in order. Call only when `is_complete()`.
    fn reassemble_into_bytes(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..self.total_chunks {
            if let Some(bytes) = self.chunks.remove(&i) {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }
}

/// Inbound reassembly table keyed by message id. Buffers live until their
/// message completes or the table is cleared at session teardown.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<u32, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verified chunk. Single-chunk messages complete immediately
    /// without touching the table; a repeated index overwrites the earlier payload.
    pub fn ingest(&mut self, header: &FrameHeader, payload: Vec<u8>) -> Reassembly {
        if header.chunk_index >= header.total_chunks {
            warn!(
                message_id = header.message_id,
                chunk_index = header.chunk_index,
                total = header.total_chunks,
                "chunk index out of range dropped"
            );
            return Reassembly::Incomplete;
        }

        if header.total_chunks == 1 {
            return Reassembly::Complete(CompleteMessage {
                message_id: header.message_id,
                message_type: header.message_type,
                payload,
            });
        }

        let buffer = self
            .buffers
            .entry(header.message_id)
            .or_insert_with(|| ReassemblyBuffer::new(header.total_chunks, header.message_type));
        if buffer.total_chunks != header.total_chunks {
            warn!(
                message_id = header.message_id,
                was = buffer.total_chunks,
                now = header.total_chunks,
                "chunk count changed mid-message; adopting new count"
            );
            buffer.total_chunks = header.total_chunks;
            let total = buffer.total_chunks;
            buffer.chunks.retain(|i, _| *i < total);
        }
        buffer.chunks.insert(header.chunk_index, payload);
        debug!(
            message_id = header.message_id,
            chunk_index = header.chunk_index,
            received = buffer.chunks.len(),
            total = buffer.total_chunks,
            "chunk buffered"
        );

        if !buffer.is_complete() {
            return Reassembly::Incomplete;
        }
        match self.buffers.remove(&header.message_id) {
            Some(buffer) => {
                let message_type = buffer.message_type;
                Reassembly::Complete(CompleteMessage {
                    message_id: header.message_id,
                    message_type,
                    payload: buffer.reassemble_into_bytes(),
                })
            }
            None => Reassembly::Incomplete,
        }
    }

    /// Messages with at least one chunk buffered and not yet complete.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Drop every open buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::{Rng, RngCore};

    use super::*;
    use crate::wire::{decode_frame, Frame};

    fn fixed_clock() -> u64 {
        1_700_000_000_000
    }

    fn feed(reassembler: &mut Reassembler, frames: &[Frame]) -> Option<CompleteMessage> {
        let mut out = None;
        for frame in frames {
            if let Reassembly::Complete(m) = reassembler.ingest(&frame.header, frame.payload.clone())
            {
                out = Some(m);
            }
        }
        out
    }

    #[test]
    fn chunk_size_tracks_mtu() {
        assert_eq!(chunk_size_for_mtu(517), 492);
        assert_eq!(chunk_size_for_mtu(185), 160);
        assert_eq!(chunk_size_for_mtu(2048), MAX_PAYLOAD_SIZE);
        assert_eq!(chunk_size_for_mtu(10), 1);
    }

    #[test]
    fn split_counts_and_ranges() {
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let frames =
            split_into_frames(9, MessageType::Image, &payload, 492, &fixed_clock).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), 492);
        assert_eq!(frames[1].payload.len(), 492);
        assert_eq!(frames[2].payload.len(), 16);
        assert_eq!(&frames[2].payload[..], &payload[984..]);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.header.chunk_index as usize, i);
            assert_eq!(f.header.total_chunks, 3);
            assert_eq!(f.header.message_id, 9);
            assert_eq!(f.header.message_type, MessageType::Image);
        }
    }

    #[test]
    fn split_exact_multiple() {
        let frames =
            split_into_frames(1, MessageType::Text, &[7u8; 984], 492, &fixed_clock).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload.len(), 492);
    }

    #[test]
    fn split_zero_length_yields_one_empty_chunk() {
        let frames = split_into_frames(1, MessageType::Text, &[], 492, &fixed_clock).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.total_chunks, 1);
        assert_eq!(frames[0].header.payload_length, 0);
    }

    #[test]
    fn timestamps_are_taken_per_chunk() {
        let tick = std::cell::Cell::new(100u64);
        let clock = || {
            tick.set(tick.get() + 1);
            tick.get()
        };
        let frames = split_into_frames(1, MessageType::Text, &[0u8; 30], 10, &clock).unwrap();
        let stamps: Vec<u64> = frames.iter().map(|f| f.header.timestamp).collect();
        assert_eq!(stamps, vec![101, 102, 103]);
    }

    #[test]
    fn random_payloads_survive_fragmentation() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let len = rng.gen_range(0..5000);
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);
            let id = rng.gen::<u32>();
            let frames =
                split_into_frames(id, MessageType::Video, &payload, MAX_PAYLOAD_SIZE, &fixed_clock)
                    .unwrap();
            for f in &frames {
                assert!(f.header.payload_length as usize <= MAX_PAYLOAD_SIZE);
                assert!(f.header.chunk_index < f.header.total_chunks);
            }
            let mut reassembler = Reassembler::new();
            let done = feed(&mut reassembler, &frames).expect("message should complete");
            assert_eq!(done.payload, payload);
            assert_eq!(done.message_id, id);
            assert_eq!(reassembler.pending(), 0);
        }
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut frames =
            split_into_frames(5, MessageType::Image, &payload, 492, &fixed_clock).unwrap();
        frames.shuffle(&mut rand::thread_rng());
        let mut reassembler = Reassembler::new();
        let done = feed(&mut reassembler, &frames).unwrap();
        assert_eq!(done.payload, payload);
        assert_eq!(done.message_type, MessageType::Image);
    }

    #[test]
    fn interleaved_messages_are_independent() {
        let a = vec![1u8; 1200];
        let b = vec![2u8; 700];
        let fa = split_into_frames(1, MessageType::Image, &a, 492, &fixed_clock).unwrap();
        let fb = split_into_frames(2, MessageType::Video, &b, 492, &fixed_clock).unwrap();
        let mut reassembler = Reassembler::new();
        assert_eq!(
            reassembler.ingest(&fa[0].header, fa[0].payload.clone()),
            Reassembly::Incomplete
        );
        assert_eq!(
            reassembler.ingest(&fb[0].header, fb[0].payload.clone()),
            Reassembly::Incomplete
        );
        assert_eq!(reassembler.pending(), 2);
        let done_b = feed(&mut reassembler, &fb[1..]).unwrap();
        assert_eq!(done_b.payload, b);
        let done_a = feed(&mut reassembler, &fa[1..]).unwrap();
        assert_eq!(done_a.payload, a);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn repeated_chunk_overwrites() {
        let frames =
            split_into_frames(3, MessageType::Text, &[9u8; 600], 492, &fixed_clock).unwrap();
        let mut reassembler = Reassembler::new();
        assert_eq!(
            reassembler.ingest(&frames[0].header, vec![0u8; 492]),
            Reassembly::Incomplete
        );
        assert_eq!(
            reassembler.ingest(&frames[0].header, frames[0].payload.clone()),
            Reassembly::Incomplete
        );
        let done = feed(&mut reassembler, &frames[1..]).unwrap();
        assert_eq!(done.payload, vec![9u8; 600]);
    }

    #[test]
    fn corrupted_chunk_never_completes() {
        let payload = vec![0x5Au8; 1500];
        let frames =
            split_into_frames(11, MessageType::Image, &payload, 492, &fixed_clock).unwrap();
        let mut reassembler = Reassembler::new();
        for (i, frame) in frames.iter().enumerate() {
            let mut bytes = frame.encode().unwrap();
            if i == 1 {
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
            }
            match decode_frame(&bytes) {
                Ok(f) => {
                    assert_eq!(reassembler.ingest(&f.header, f.payload), Reassembly::Incomplete);
                }
                Err(e) => assert!(e.is_integrity()),
            }
        }
        assert_eq!(reassembler.pending(), 1);
        reassembler.clear();
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn mismatched_total_adopts_latest_count() {
        let frames =
            split_into_frames(4, MessageType::Text, &[1u8; 1000], 492, &fixed_clock).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.ingest(&frames[0].header, frames[0].payload.clone());
        let mut second = frames[1].header;
        second.total_chunks = 2;
        let done = reassembler.ingest(&second, frames[1].payload.clone());
        match done {
            Reassembly::Complete(m) => assert_eq!(m.payload.len(), 984),
            Reassembly::Incomplete => panic!("expected completion at the adopted count"),
        }
    }

    #[test]
    fn shrunk_total_discards_indices_past_new_count() {
        let frames =
            split_into_frames(6, MessageType::Text, &[3u8; 2000], 492, &fixed_clock).unwrap();
        assert_eq!(frames.len(), 5);
        let mut reassembler = Reassembler::new();
        reassembler.ingest(&frames[3].header, frames[3].payload.clone());
        reassembler.ingest(&frames[4].header, frames[4].payload.clone());

        let mut first = frames[0].header;
        first.total_chunks = 2;
        assert_eq!(
            reassembler.ingest(&first, frames[0].payload.clone()),
            Reassembly::Incomplete
        );
        let mut second = frames[1].header;
        second.total_chunks = 2;
        match reassembler.ingest(&second, frames[1].payload.clone()) {
            Reassembly::Complete(m) => assert_eq!(m.payload, vec![3u8; 984]),
            Reassembly::Incomplete => panic!("stale chunks must not block completion"),
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn out_of_range_index_is_not_buffered() {
        let frames =
            split_into_frames(8, MessageType::Text, &[2u8; 600], 492, &fixed_clock).unwrap();
        let mut reassembler = Reassembler::new();
        let mut bogus = frames[0].header;
        bogus.chunk_index = 5;
        assert_eq!(reassembler.ingest(&bogus, vec![0u8; 4]), Reassembly::Incomplete);
        assert_eq!(reassembler.pending(), 0);
        let done = feed(&mut reassembler, &frames).unwrap();
        assert_eq!(done.payload, vec![2u8; 600]);
    }

    #[test]
    fn many_chunk_message_reassembles_in_linear_time() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let frames =
            split_into_frames(12, MessageType::Video, &payload, 1, &fixed_clock).unwrap();
        assert_eq!(frames.len(), 20_000);

        let started = std::time::Instant::now();
        let mut reassembler = Reassembler::new();
        let done = feed(&mut reassembler, &frames).unwrap();
        assert_eq!(done.payload, payload);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "reassembly took {:?}",
            started.elapsed()
        );
    }
}
