//! # patchbay
//!
//! Core primitives for the patchbay multiplexing hub.
//!
//! This crate holds the pieces that have no opinion about sockets or
//! selectors:
//!
//! - [`FifoBuffer`]: a bounded, growable single-producer/single-consumer
//!   byte queue with close semantics, used as the read and write staging
//!   area of every connection.
//! - [`Executor`] / [`Lane`]: the worker-pool boundary and the
//!   per-connection sequencer that keeps callback delivery ordered while
//!   different connections progress in parallel.
//!
//! ## Usage
//!
//! ```rust
//! use patchbay::FifoBuffer;
//!
//! let buf = FifoBuffer::new(64, 1024);
//! buf.write(b"hello").unwrap();
//!
//! let mut out = [0u8; 5];
//! assert_eq!(buf.read_non_blocking(&mut out), 5);
//! assert_eq!(&out, b"hello");
//! ```

mod exec;
mod fifo;

pub use exec::{Executor, Job, Lane};
pub use fifo::{FifoBuffer, FifoClosed};
