//! Chunk framing header.
//!
//! Every message on the wire is one or more chunks; each chunk is a 2-byte
//! header followed by its payload. A message is the concatenation of chunk
//! payloads up to and including the chunk whose last bit is set.
//!
//! Layout (MSB first of the 16-bit value):
//!
//! ```text
//! Bit     15      14..0
//! Field   last    payload length
//! ```
//!
//! A zero-length chunk is legal only as a message terminator.

/// Chunk header size in bytes.
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Largest payload a single chunk can carry (15-bit length field).
pub const MAX_CHUNK_LEN: usize = 0x7FFF;

const LAST: u16 = 0x8000;

/// Decoded 2-byte chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader(u16);

impl ChunkHeader {
    /// Encode a header for a chunk of `len` payload bytes. `has_more`
    /// means further chunks of the same message follow; the final chunk is
    /// packed with `has_more = false`.
    #[inline]
    pub fn pack(len: usize, has_more: bool) -> [u8; CHUNK_HEADER_SIZE] {
        debug_assert!(len <= MAX_CHUNK_LEN);
        let value = len as u16 | if has_more { 0 } else { LAST };
        value.to_be_bytes()
    }

    /// Decode a header from its wire bytes.
    #[inline]
    pub fn parse(bytes: [u8; CHUNK_HEADER_SIZE]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Payload length of this chunk.
    #[inline]
    pub fn len(&self) -> usize {
        (self.0 & !LAST) as usize
    }

    /// True for a chunk with no payload (a bare terminator).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when this is the final chunk of its message.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.0 & LAST != 0
    }
}
