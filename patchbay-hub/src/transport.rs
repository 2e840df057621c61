//! Per-connection state and the OS handles behind it.
//!
//! A [`Transport`] is the application-facing half of a connection: the two
//! staging buffers, the receiver, the dispatch lane, and the capability the
//! peer advertised. The selector-facing half is the [`Conduit`], which owns
//! the actual handles and their registrations and is only ever touched from
//! the selector thread.
//!
//! Sometimes a single OS handle does both read and write, like a socket.
//! In other times two handles are used, one per direction, like the pipe
//! ends of a child process. [`MonoConduit`] and [`DualConduit`] cover the
//! two shapes; the difference that matters is how a half-close works: a
//! socket is shut down per direction and stays registered until both
//! directions are gone, while a pipe end is simply dropped and its
//! registration removed.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
#[cfg(unix)]
use mio::unix::pipe;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, warn};

use patchbay::{FifoBuffer, Lane};
use patchbay_shared::{Capability, ChunkHeader};

use crate::error::TransportError;
use crate::hub::Hub;

/// Initial capacity of each direction's staging buffer.
pub(crate) const BUFFER_INITIAL: usize = 16 * 1024;

/// Hard cap on buffered outgoing bytes; producers block past this.
pub(crate) const SEND_BUFFER_LIMIT: usize = 256 * 1024;

/// Default hard cap on buffered incoming bytes. A single command has no
/// size restriction, so the cap is effectively "as much as we can hold".
pub(crate) const RECV_BUFFER_LIMIT: usize = i32::MAX as usize;

/// Consumer of reassembled command packets.
///
/// `handle` is invoked once per packet in wire arrival order; `terminate`
/// at most once, after which no further callbacks occur. Both run on the
/// shared worker pool through the transport's lane, never on the selector
/// thread.
pub trait Receiver: Send + Sync {
    fn handle(&self, packet: Vec<u8>);
    fn terminate(&self, err: TransportError);
}

/// Back-reference to the channel that owns a transport.
///
/// Consulted by the terminal EOF event: a peer hanging up while the local
/// side is already tearing the channel down is expected and not reported.
/// The reference is a relation, not an ownership edge; it is installed
/// after both objects exist and cleared on termination.
pub trait OwningChannel: Send + Sync {
    fn is_closing(&self) -> bool;
}

/// Application-facing half of a hub-serviced connection.
pub struct Transport {
    hub: Arc<Hub>,
    capability: Capability,
    /// Bytes read off the wire but not yet reassembled into packets.
    pub(crate) rb: FifoBuffer,
    /// Bytes queued for the wire but not yet written.
    pub(crate) wb: FifoBuffer,
    pub(crate) receiver: OnceLock<Arc<dyn Receiver>>,
    pub(crate) lane: Lane,
    owner: Mutex<Option<Arc<dyn OwningChannel>>>,
    pub(crate) terminated: AtomicBool,
    pub(crate) read_token: Token,
    pub(crate) write_token: Token,
}

impl Transport {
    pub(crate) fn new(
        hub: Arc<Hub>,
        capability: Capability,
        lane: Lane,
        read_token: Token,
        write_token: Token,
        recv_limit: usize,
    ) -> Self {
        Self {
            hub,
            capability,
            rb: FifoBuffer::new(BUFFER_INITIAL.min(recv_limit), recv_limit),
            wb: FifoBuffer::new(BUFFER_INITIAL, SEND_BUFFER_LIMIT),
            receiver: OnceLock::new(),
            lane,
            owner: Mutex::new(None),
            terminated: AtomicBool::new(false),
            read_token,
            write_token,
        }
    }

    /// Capability the peer advertised during negotiation.
    pub fn remote_capability(&self) -> Capability {
        self.capability
    }

    /// Install the receiver and become ready to read. The receiver is set
    /// exactly once; a second call is a contract violation and is ignored.
    pub fn setup(&self, receiver: Arc<dyn Receiver>) {
        if self.receiver.set(receiver).is_err() {
            warn!("receiver already installed; ignoring setup");
            return;
        }
        self.schedule_reregister();
    }

    /// Install the owning-channel back-reference (see [`OwningChannel`]).
    pub fn bind_owner(&self, owner: Arc<dyn OwningChannel>) {
        *self.owner.lock() = Some(owner);
    }

    pub(crate) fn owner_is_closing(&self) -> bool {
        self.owner.lock().as_ref().map_or(false, |o| o.is_closing())
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    /// Fragment `data` into chunks of at most the hub's frame size and
    /// queue them for transmission, blocking while the write buffer is
    /// full. An empty block still emits its terminator chunk.
    ///
    /// Fails with a `BrokenPipe`-kind error if the connection is torn down
    /// while waiting for space; chunks queued before the failure still
    /// transmit. Concurrent callers must serialize externally, or their
    /// chunks interleave on the wire.
    pub fn write_block(&self, data: &[u8]) -> io::Result<()> {
        let frame_size = self.hub.frame_size();
        let mut pos = 0;
        loop {
            let chunk = frame_size.min(data.len() - pos);
            let has_more = pos + chunk < data.len();
            let queued = self
                .wb
                .write(&ChunkHeader::pack(chunk, has_more))
                .and_then(|()| self.wb.write(&data[pos..pos + chunk]));
            if let Err(e) = queued {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, e));
            }
            // Re-registration per chunk: the selector picks up write
            // interest and drains while we may still be blocked on space
            // for a later chunk.
            self.schedule_reregister();
            pos += chunk;
            if !has_more {
                return Ok(());
            }
        }
    }

    /// Close the outgoing direction. Queued bytes still flush; once the
    /// write buffer drains, the selector half-closes the write handle.
    pub fn close_write(&self) {
        self.wb.close();
        self.schedule_reregister();
    }

    /// Request a half-close of the incoming direction. Runs as a selector
    /// task; buffered packets already reassembled still deliver.
    pub fn close_read(self: &Arc<Self>) {
        let t = self.clone();
        self.hub.schedule(move |reactor| reactor.close_read_for(&t));
    }

    pub(crate) fn schedule_reregister(&self) {
        let (rt, wt) = (self.read_token, self.write_token);
        self.hub.schedule(move |reactor| reactor.update_tokens(rt, wt));
    }

    /// We want read interest when someone is ready to consume packets and
    /// the read buffer has room.
    pub(crate) fn wants_read(&self) -> bool {
        self.receiver.get().is_some() && self.rb.writable() != 0
    }

    /// We want write interest while the write buffer has queued bytes, or
    /// is closed-and-drained (the `-1` sentinel keeps interest alive until
    /// the selector observes the drain and half-closes the handle).
    pub(crate) fn wants_write(&self) -> bool {
        self.wb.readable() != 0
    }
}

/// One duplex handle that backs both directions of a mono conduit.
pub(crate) enum DuplexStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl DuplexStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            DuplexStream::Tcp(s) => s.shutdown(how),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.shutdown(how),
        }
    }
}

impl Read for DuplexStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DuplexStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for DuplexStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DuplexStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DuplexStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.flush(),
        }
    }
}

impl Source for DuplexStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            DuplexStream::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            DuplexStream::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            DuplexStream::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            DuplexStream::Unix(s) => s.deregister(registry),
        }
    }
}

/// Selector-side handle state. All methods run on the selector thread.
pub(crate) enum Conduit {
    Mono(MonoConduit),
    #[cfg(unix)]
    Dual(DualConduit),
}

pub(crate) struct MonoConduit {
    stream: DuplexStream,
    registered: bool,
    r_open: bool,
    w_open: bool,
}

impl MonoConduit {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            registered: false,
            r_open: true,
            w_open: true,
        }
    }

    fn apply_interest(&mut self, registry: &Registry, t: &Transport) -> io::Result<()> {
        let mut interest = None;
        if t.wants_read() && self.r_open {
            interest = Some(Interest::READABLE);
        }
        if t.wants_write() && self.w_open {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        match interest {
            Some(i) if self.registered => registry.reregister(&mut self.stream, t.read_token, i),
            Some(i) => {
                registry.register(&mut self.stream, t.read_token, i)?;
                self.registered = true;
                Ok(())
            }
            None => {
                if self.registered {
                    self.registered = false;
                    quiet_deregister(registry, &mut self.stream);
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
pub(crate) struct DualConduit {
    r: Option<pipe::Receiver>,
    w: Option<pipe::Sender>,
    r_registered: bool,
    w_registered: bool,
}

#[cfg(unix)]
impl DualConduit {
    pub(crate) fn new(r: pipe::Receiver, w: pipe::Sender) -> Self {
        Self {
            r: Some(r),
            w: Some(w),
            r_registered: false,
            w_registered: false,
        }
    }
}

impl Conduit {
    pub(crate) fn r_open(&self) -> bool {
        match self {
            Conduit::Mono(m) => m.r_open,
            #[cfg(unix)]
            Conduit::Dual(d) => d.r.is_some(),
        }
    }

    pub(crate) fn w_open(&self) -> bool {
        match self {
            Conduit::Mono(m) => m.w_open,
            #[cfg(unix)]
            Conduit::Dual(d) => d.w.is_some(),
        }
    }

    pub(crate) fn reader(&mut self) -> Option<&mut dyn Read> {
        match self {
            Conduit::Mono(m) if m.r_open => Some(&mut m.stream),
            Conduit::Mono(_) => None,
            #[cfg(unix)]
            Conduit::Dual(d) => d.r.as_mut().map(|r| r as &mut dyn Read),
        }
    }

    pub(crate) fn writer(&mut self) -> Option<&mut dyn Write> {
        match self {
            Conduit::Mono(m) if m.w_open => Some(&mut m.stream),
            Conduit::Mono(_) => None,
            #[cfg(unix)]
            Conduit::Dual(d) => d.w.as_mut().map(|w| w as &mut dyn Write),
        }
    }

    /// Recompute and apply the interest set for this conduit. An empty
    /// interest set is expressed by deregistering; applying a non-empty set
    /// always goes through the OS so readiness is re-armed even when the
    /// bits did not change.
    pub(crate) fn reregister(&mut self, registry: &Registry, t: &Transport) -> io::Result<()> {
        match self {
            Conduit::Mono(m) => m.apply_interest(registry, t),
            #[cfg(unix)]
            Conduit::Dual(d) => {
                if let Some(r) = d.r.as_mut() {
                    if t.wants_read() {
                        if d.r_registered {
                            registry.reregister(r, t.read_token, Interest::READABLE)?;
                        } else {
                            registry.register(r, t.read_token, Interest::READABLE)?;
                            d.r_registered = true;
                        }
                    } else if d.r_registered {
                        d.r_registered = false;
                        quiet_deregister(registry, r);
                    }
                }
                if let Some(w) = d.w.as_mut() {
                    if t.wants_write() {
                        if d.w_registered {
                            registry.reregister(w, t.write_token, Interest::WRITABLE)?;
                        } else {
                            registry.register(w, t.write_token, Interest::WRITABLE)?;
                            d.w_registered = true;
                        }
                    } else if d.w_registered {
                        d.w_registered = false;
                        quiet_deregister(registry, w);
                    }
                }
                Ok(())
            }
        }
    }

    /// Half-close the incoming direction and close `rb` so its drain
    /// signals EOF. Returns the token whose registration went away, if any.
    pub(crate) fn close_read(
        &mut self,
        registry: &Registry,
        t: &Transport,
    ) -> io::Result<Option<Token>> {
        match self {
            Conduit::Mono(m) => {
                if !m.r_open {
                    return Ok(None);
                }
                m.r_open = false;
                t.rb.close();
                half_shutdown(&m.stream, Shutdown::Read)?;
                if m.w_open {
                    m.apply_interest(registry, t)?;
                    Ok(None)
                } else {
                    if m.registered {
                        m.registered = false;
                        quiet_deregister(registry, &mut m.stream);
                    }
                    Ok(Some(t.read_token))
                }
            }
            #[cfg(unix)]
            Conduit::Dual(d) => match d.r.take() {
                Some(mut r) => {
                    t.rb.close();
                    if d.r_registered {
                        d.r_registered = false;
                        quiet_deregister(registry, &mut r);
                    }
                    Ok(Some(t.read_token))
                }
                None => Ok(None),
            },
        }
    }

    /// The write-side counterpart of [`Conduit::close_read`]: half-close
    /// the outgoing direction and close `wb` against further producers.
    pub(crate) fn close_write(
        &mut self,
        registry: &Registry,
        t: &Transport,
    ) -> io::Result<Option<Token>> {
        match self {
            Conduit::Mono(m) => {
                if !m.w_open {
                    return Ok(None);
                }
                m.w_open = false;
                t.wb.close();
                half_shutdown(&m.stream, Shutdown::Write)?;
                if m.r_open {
                    m.apply_interest(registry, t)?;
                    Ok(None)
                } else {
                    if m.registered {
                        m.registered = false;
                        quiet_deregister(registry, &mut m.stream);
                    }
                    Ok(Some(t.write_token))
                }
            }
            #[cfg(unix)]
            Conduit::Dual(d) => match d.w.take() {
                Some(mut w) => {
                    t.wb.close();
                    if d.w_registered {
                        d.w_registered = false;
                        quiet_deregister(registry, &mut w);
                    }
                    Ok(Some(t.write_token))
                }
                None => Ok(None),
            },
        }
    }
}

/// Shut down one direction of a duplex stream. A peer that already tore the
/// connection down makes this report not-connected, which is not an error
/// worth aborting over.
fn half_shutdown(stream: &DuplexStream, how: Shutdown) -> io::Result<()> {
    match stream.shutdown(how) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deregistration happens on cleanup paths where the handle may already be
/// half-dead; log and move on rather than aborting the cleanup.
fn quiet_deregister<S: Source + ?Sized>(registry: &Registry, source: &mut S) {
    if let Err(e) = source.deregister(registry) {
        debug!(error = %e, "deregister failed during close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay::{Executor, Job};

    struct Inline;

    impl Executor for Inline {
        fn execute(&self, job: Job) {
            job();
        }
    }

    fn test_transport(frame_size: usize) -> Transport {
        let hub = Hub::new(Arc::new(Inline)).unwrap();
        hub.set_frame_size(frame_size);
        Transport::new(
            hub.clone(),
            Capability::current(),
            Lane::new(hub.pool().clone()),
            Token(1),
            Token(1),
            RECV_BUFFER_LIMIT,
        )
    }

    fn queued_bytes(t: &Transport) -> Vec<u8> {
        let mut out = vec![0u8; t.wb.readable().max(0) as usize];
        let n = t.wb.read_non_blocking(&mut out);
        out.truncate(n);
        out
    }

    #[test]
    fn test_write_block_fragments_at_frame_size() {
        let t = test_transport(4);
        t.write_block(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(
            queued_bytes(&t),
            vec![0x00, 0x04, 0, 1, 2, 3, 0x00, 0x04, 4, 5, 6, 7, 0x80, 0x02, 8, 9]
        );
    }

    #[test]
    fn test_write_block_single_chunk() {
        let t = test_transport(8192);
        t.write_block(b"hello").unwrap();
        assert_eq!(queued_bytes(&t), vec![0x80, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_write_block_empty_emits_terminator() {
        let t = test_transport(4);
        t.write_block(&[]).unwrap();
        assert_eq!(queued_bytes(&t), vec![0x80, 0x00]);
    }

    #[test]
    fn test_write_block_exact_multiple_of_frame() {
        let t = test_transport(4);
        t.write_block(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        // The second chunk is the last; no empty terminator follows.
        assert_eq!(
            queued_bytes(&t),
            vec![0x00, 0x04, 1, 2, 3, 4, 0x80, 0x04, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_write_block_fails_once_closed() {
        let t = test_transport(4);
        t.wb.close();
        let err = t.write_block(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_wants_read_requires_receiver_and_room() {
        let t = test_transport(4);
        assert!(!t.wants_read());

        struct Null;
        impl Receiver for Null {
            fn handle(&self, _packet: Vec<u8>) {}
            fn terminate(&self, _err: TransportError) {}
        }
        t.setup(Arc::new(Null));
        assert!(t.wants_read());
        t.rb.close();
        assert!(!t.wants_read());
    }

    #[test]
    fn test_wants_write_tracks_buffer_and_close_sentinel() {
        let t = test_transport(4);
        assert!(!t.wants_write());
        t.write_block(b"x").unwrap();
        assert!(t.wants_write());

        let t = test_transport(4);
        // Closed-and-empty still wants write interest: the selector must
        // observe the drain to half-close the handle.
        t.close_write();
        assert!(t.wants_write());
    }
}
