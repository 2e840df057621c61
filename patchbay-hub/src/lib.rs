//! # patchbay-hub
//!
//! Switch board of many framed command streams through one readiness
//! selector. N producer threads and a shared worker pool attend to M
//! connections with the help of a single selector thread.
//!
//! ## Pieces
//!
//! - [`Hub`]: owns the poll loop; other threads inject work through a
//!   lock-free task queue and a waker.
//! - [`Transport`]: per-connection state — staging buffers, receiver,
//!   ordered dispatch lane, capability.
//! - [`IoPair`] / [`Wired`]: the builder boundary deciding mono vs dual vs
//!   caller-managed fallback.
//! - [`Receiver`] / [`OwningChannel`] / [`ReadyHook`]: the callback
//!   surfaces of the embedding runtime.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use patchbay::{Executor, Job};
//! use patchbay_hub::{Hub, IoPair, TransportConfig, Wired};
//! use patchbay_shared::{Capability, Mode};
//!
//! struct Inline;
//! impl Executor for Inline {
//!     fn execute(&self, job: Job) {
//!         job();
//!     }
//! }
//!
//! # fn main() -> Result<(), patchbay_hub::HubError> {
//! let hub = Hub::new(Arc::new(Inline))?;
//! {
//!     let hub = hub.clone();
//!     std::thread::spawn(move || hub.run());
//! }
//!
//! let socket = std::net::TcpStream::connect("127.0.0.1:7000")?;
//! while !hub.is_running() {
//!     std::thread::yield_now();
//! }
//! let wired = hub.connect(
//!     IoPair::Tcp(socket),
//!     Mode::Binary,
//!     Capability::current(),
//!     TransportConfig::default(),
//! )?;
//! if let Wired::Transport(transport) = wired {
//!     transport.write_block(b"hello")?;
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod error;
mod hub;
mod transport;

pub use builder::{IoPair, TransportConfig, Wired};
pub use error::{HubError, Result, TransportError};
pub use hub::{Hub, ReadyHook, DEFAULT_FRAME_SIZE};
pub use transport::{OwningChannel, Receiver, Transport};

// The builder takes mio pipe ends and hooks register mio sources; re-export
// so embedders do not have to pin the same mio version themselves.
pub use mio;
