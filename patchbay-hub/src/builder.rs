//! Wiring connections into the hub.
//!
//! The hub accepts a pair of byte streams per connection. Whether the pair
//! can be serviced by the selector is a property of the handle types, so
//! the [`IoPair`] variant carries the decision: sockets give a mono
//! transport, pipe ends a dual one, and anything else falls back to a
//! caller-managed transport.

use std::io::{self, Read, Write};
use std::sync::Arc;

#[cfg(unix)]
use mio::unix::pipe;

use patchbay::Lane;
use patchbay_shared::{Capability, Mode};

use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::transport::{Conduit, DuplexStream, MonoConduit, Transport, RECV_BUFFER_LIMIT};
#[cfg(unix)]
use crate::transport::DualConduit;

/// The byte streams backing one connection.
pub enum IoPair {
    /// A connected TCP socket; one handle backs both directions.
    Tcp(std::net::TcpStream),
    /// A connected Unix-domain socket; one handle backs both directions.
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    /// Distinct pipe ends per direction, e.g. the stdio of a child process.
    #[cfg(unix)]
    Pipe { r: pipe::Receiver, w: pipe::Sender },
    /// Streams with no readiness support. The hub hands these back.
    Legacy {
        r: Box<dyn Read + Send>,
        w: Box<dyn Write + Send>,
    },
}

/// Outcome of offering a connection to the hub.
pub enum Wired {
    /// The connection is serviced by the selector.
    Transport(Arc<Transport>),
    /// The connection cannot be serviced here (not selectable, text mode,
    /// or a peer without chunked framing). The caller wires a conventional
    /// thread-per-connection transport around the returned streams; the
    /// hub does not manage them.
    Deferred {
        r: Box<dyn Read + Send>,
        w: Box<dyn Write + Send>,
    },
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hard cap on buffered inbound bytes. A single command must
    /// reassemble below this; crossing it aborts the connection.
    pub recv_buffer_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_limit: RECV_BUFFER_LIMIT,
        }
    }
}

impl Hub {
    /// Offer a connection to the hub.
    ///
    /// Selectable streams of a binary-mode peer that advertises chunked
    /// framing come back as [`Wired::Transport`], registered with the
    /// selector (call [`Transport::setup`] to start reading). Everything
    /// else comes back as [`Wired::Deferred`].
    ///
    /// Fails with [`HubError::NotRunning`] when no thread is in
    /// [`Hub::run`] yet: a transport registered with an idle selector
    /// would never make progress.
    pub fn connect(
        self: &Arc<Self>,
        io: IoPair,
        mode: Mode,
        capability: Capability,
        config: TransportConfig,
    ) -> Result<Wired> {
        if mode != Mode::Binary || !capability.supports_chunking() {
            return Ok(defer(io)?);
        }
        let io = match io {
            IoPair::Legacy { r, w } => return Ok(Wired::Deferred { r, w }),
            selectable => selectable,
        };
        if !self.is_running() {
            return Err(HubError::NotRunning);
        }

        let lane = Lane::new(self.pool().clone());
        let (conduit, transport) = match io {
            IoPair::Tcp(stream) => {
                stream.set_nonblocking(true)?;
                let stream = mio::net::TcpStream::from_std(stream);
                let token = self.allocate_token();
                let transport = Transport::new(
                    self.clone(),
                    capability,
                    lane,
                    token,
                    token,
                    config.recv_buffer_limit,
                );
                let conduit = Conduit::Mono(MonoConduit::new(DuplexStream::Tcp(stream)));
                (conduit, transport)
            }
            #[cfg(unix)]
            IoPair::Unix(stream) => {
                stream.set_nonblocking(true)?;
                let stream = mio::net::UnixStream::from_std(stream);
                let token = self.allocate_token();
                let transport = Transport::new(
                    self.clone(),
                    capability,
                    lane,
                    token,
                    token,
                    config.recv_buffer_limit,
                );
                let conduit = Conduit::Mono(MonoConduit::new(DuplexStream::Unix(stream)));
                (conduit, transport)
            }
            #[cfg(unix)]
            IoPair::Pipe { r, w } => {
                let read_token = self.allocate_token();
                let write_token = self.allocate_token();
                let transport = Transport::new(
                    self.clone(),
                    capability,
                    lane,
                    read_token,
                    write_token,
                    config.recv_buffer_limit,
                );
                let conduit = Conduit::Dual(DualConduit::new(r, w));
                (conduit, transport)
            }
            IoPair::Legacy { .. } => unreachable!("handled above"),
        };

        let transport = Arc::new(transport);
        let registered = transport.clone();
        self.schedule(move |reactor| reactor.register_transport(conduit, registered));
        Ok(Wired::Transport(transport))
    }
}

/// Hand the streams back for a caller-managed transport.
fn defer(io: IoPair) -> io::Result<Wired> {
    Ok(match io {
        IoPair::Tcp(stream) => {
            let r = Box::new(stream.try_clone()?);
            Wired::Deferred { r, w: Box::new(stream) }
        }
        #[cfg(unix)]
        IoPair::Unix(stream) => {
            let r = Box::new(stream.try_clone()?);
            Wired::Deferred { r, w: Box::new(stream) }
        }
        #[cfg(unix)]
        IoPair::Pipe { r, w } => Wired::Deferred {
            r: Box::new(r),
            w: Box::new(w),
        },
        IoPair::Legacy { r, w } => Wired::Deferred { r, w },
    })
}
