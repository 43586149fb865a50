//! Integrity: per-chunk CRC-32, computed on send and verified on receive.

/// CRC-32 (IEEE 802.3, reflected, init and final XOR 0xFFFFFFFF) over a chunk payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Verify a chunk payload against the checksum carried in its header.
pub fn verify_chunk(payload: &[u8], expected: u32) -> bool {
    checksum(payload) == expected
}
