//! # patchbay-test-support
//!
//! Test doubles for exercising the hub: a small fixed worker pool, a
//! receiver that records everything it is handed, an owning-channel flag,
//! and wire helpers for writing framed messages by hand.

mod pool;
mod recorder;

pub use pool::FixedPool;
pub use recorder::{CollectingReceiver, OwnerFlag};

use std::time::{Duration, Instant};

use patchbay_shared::ChunkHeader;

/// Poll `cond` until it holds or `timeout` elapses. Returns whether the
/// condition was observed.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Frame `payload` into chunk wire bytes the way a peer runtime would,
/// capping each chunk at `frame_size`.
pub fn frame_message(payload: &[u8], frame_size: usize) -> Vec<u8> {
    assert!(frame_size >= 1);
    let mut wire = Vec::with_capacity(payload.len() + 2 * (payload.len() / frame_size + 1));
    let mut pos = 0;
    loop {
        let chunk = frame_size.min(payload.len() - pos);
        let has_more = pos + chunk < payload.len();
        wire.extend_from_slice(&ChunkHeader::pack(chunk, has_more));
        wire.extend_from_slice(&payload[pos..pos + chunk]);
        pos += chunk;
        if !has_more {
            return wire;
        }
    }
}

/// Parse a chunk wire stream back into whole messages. Panics on a
/// truncated stream; tests feed it complete captures.
pub fn unframe_messages(mut wire: &[u8]) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current = Vec::new();
    while !wire.is_empty() {
        assert!(wire.len() >= 2, "truncated chunk header");
        let header = ChunkHeader::parse([wire[0], wire[1]]);
        assert!(wire.len() >= 2 + header.len(), "truncated chunk payload");
        current.extend_from_slice(&wire[2..2 + header.len()]);
        wire = &wire[2 + header.len()..];
        if header.is_last() {
            messages.push(std::mem::take(&mut current));
        }
    }
    assert!(current.is_empty(), "trailing partial message");
    messages
}
