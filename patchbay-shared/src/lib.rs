//! # patchbay-shared
//!
//! Wire-level types shared by the patchbay hub and channel runtimes:
//!
//! - [`ChunkHeader`]: the 2-byte chunk framing header (15-bit payload
//!   length plus a last-chunk flag)
//! - [`Capability`]: the remote feature mask negotiated before a
//!   connection is handed to the hub
//! - [`Mode`]: binary vs. text transport discriminator
//!
//! ## Usage
//!
//! ```rust
//! use patchbay_shared::{ChunkHeader, MAX_CHUNK_LEN};
//!
//! let bytes = ChunkHeader::pack(5, false);
//! let header = ChunkHeader::parse(bytes);
//! assert_eq!(header.len(), 5);
//! assert!(header.is_last());
//! assert!(header.len() <= MAX_CHUNK_LEN);
//! ```

mod capability;
mod chunk;

pub use capability::{Capability, Mode};
pub use chunk::{ChunkHeader, CHUNK_HEADER_SIZE, MAX_CHUNK_LEN};
