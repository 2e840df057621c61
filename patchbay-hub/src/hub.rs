//! The selector loop.
//!
//! One thread calls [`Hub::run`] and services every registered connection
//! from inside it: draining injected tasks, polling for readiness, pumping
//! bytes between handles and staging buffers, reassembling chunked command
//! packets, and dispatching them in order onto each connection's lane.
//!
//! Everything that touches a registration runs on the selector thread.
//! Other threads only ever enqueue a task and wake the poll.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use patchbay::{Executor, FifoBuffer};
use patchbay_shared::{ChunkHeader, CHUNK_HEADER_SIZE, MAX_CHUNK_LEN};

use crate::error::{HubError, TransportError};
use crate::transport::{Conduit, Transport};

/// Token reserved for the loop waker.
const WAKER: Token = Token(0);

/// Default maximum chunk payload emitted by `write_block`.
pub const DEFAULT_FRAME_SIZE: usize = 8192;

/// Readiness events drained per poll call.
const EVENT_CAPACITY: usize = 1024;

pub(crate) type SelectorTask = Box<dyn FnOnce(&mut Reactor) -> io::Result<()> + Send>;

/// Handler for readiness events on a non-transport registration (server
/// listeners and the like). The hook owns its mio source and is delegated
/// every event carrying its token.
pub trait ReadyHook: Send {
    /// The handle this hook watches.
    fn source(&mut self) -> &mut dyn Source;

    /// Called on the selector thread for each readiness event.
    fn ready(&mut self, registry: &Registry, event: &Event);
}

/// Switch board of many framed connections over one readiness selector.
///
/// N producer threads and a worker pool attend to M connections with the
/// help of a single selector thread. Instantiate, spawn a thread that calls
/// [`Hub::run`], then wire connections in with [`Hub::connect`]
/// (see the builder module). `run` blocks until [`Hub::close`].
pub struct Hub {
    poll: Mutex<Poll>,
    waker: Waker,
    /// Work that must run synchronously with the poll loop, injected by
    /// arbitrary threads, drained only by the selector thread.
    tasks: SegQueue<SelectorTask>,
    pool: Arc<dyn Executor>,
    frame_size: AtomicUsize,
    next_token: AtomicUsize,
    /// Counts poll laps. Occasionally useful for diagnosing a selector
    /// thread that spins without making progress.
    generation: AtomicU64,
    shutdown: AtomicBool,
    /// Identity of the thread inside `run`, while there is one.
    selector_thread: Mutex<Option<ThreadId>>,
}

impl Hub {
    /// Create an idle hub. `pool` runs receiver callbacks; packet handling
    /// may block in user code there without stalling the selector.
    pub fn new(pool: Arc<dyn Executor>) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        Ok(Arc::new(Self {
            poll: Mutex::new(poll),
            waker,
            tasks: SegQueue::new(),
            pool,
            frame_size: AtomicUsize::new(DEFAULT_FRAME_SIZE),
            next_token: AtomicUsize::new(WAKER.0 + 1),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            selector_thread: Mutex::new(None),
        }))
    }

    /// Cap on the payload of each emitted chunk, `1..=32767`.
    pub fn set_frame_size(&self, size: usize) {
        assert!((1..=MAX_CHUNK_LEN).contains(&size), "frame size out of range");
        self.frame_size.store(size, Ordering::Relaxed);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::Relaxed)
    }

    /// Number of completed poll laps. Diagnostics only.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.selector_thread.lock().is_some()
    }

    /// Shut the hub down: the selector aborts every registered transport
    /// and `run` returns. Idempotent, callable from any thread.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake selector for close");
        }
    }

    /// Install a non-transport registration (see [`ReadyHook`]). The hook
    /// starts receiving events once the selector processes the request.
    pub fn install_hook(&self, interest: Interest, hook: Box<dyn ReadyHook>) -> Token {
        let token = self.allocate_token();
        self.schedule(move |reactor| reactor.install_hook(token, interest, hook));
        token
    }

    pub(crate) fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn pool(&self) -> &Arc<dyn Executor> {
        &self.pool
    }

    /// Enqueue work for the selector thread and wake the poll. This is the
    /// only way non-selector threads affect registration state.
    pub(crate) fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) -> io::Result<()> + Send + 'static,
    {
        self.tasks.push(Box::new(task));
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake selector");
        }
    }

    pub(crate) fn assert_selector_thread(&self) {
        assert_eq!(
            *self.selector_thread.lock(),
            Some(thread::current().id()),
            "selector-thread-only operation called from another thread",
        );
    }

    /// Attend to connections. Blocks until [`Hub::close`] (returns `Ok`) or
    /// a fatal selector error (returns `Err`); either way every registered
    /// transport has been aborted by the time this returns.
    pub fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let mut poll = self.poll.try_lock().ok_or(HubError::AlreadyRunning)?;
        let registry = poll.registry().try_clone()?;
        let mut reactor = Reactor {
            hub: self.clone(),
            registry,
            table: HashMap::new(),
        };
        *self.selector_thread.lock() = Some(thread::current().id());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_loop(&mut poll, &mut reactor)
        }));
        match result {
            Ok(out) => {
                *self.selector_thread.lock() = None;
                out
            }
            Err(payload) => {
                warn!("unexpected shutdown of the selector thread");
                reactor.abort_all(TransportError::Aborted("selector thread panicked".into()));
                *self.selector_thread.lock() = None;
                panic::resume_unwind(payload);
            }
        }
    }

    fn run_loop(&self, poll: &mut Poll, reactor: &mut Reactor) -> Result<(), HubError> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            while let Some(task) = self.tasks.pop() {
                if let Err(e) = task(reactor) {
                    warn!(error = %e, "failed to process selector task");
                    // but keep on at the next task
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                reactor.abort_all(TransportError::HubClosed);
                return Ok(());
            }

            let gen = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(keys = reactor.table.len(), gen, "selector lap");

            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "failed to poll");
                reactor.abort_all(TransportError::Aborted(format!("selector failed: {e}")));
                return Err(HubError::Io(e));
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                reactor.dispatch(event);
            }
        }
    }
}

/// Registration table entry.
#[derive(Clone)]
enum Entry {
    Transport(Rc<RefCell<Registered>>),
    Hook(Rc<RefCell<Box<dyn ReadyHook>>>),
}

pub(crate) struct Registered {
    pub(crate) conduit: Conduit,
    pub(crate) transport: Arc<Transport>,
}

/// Loop-local selector state. Lives inside [`Hub::run`]; tasks receive it
/// by mutable reference, which is what confines registration changes to the
/// selector thread.
pub(crate) struct Reactor {
    hub: Arc<Hub>,
    registry: Registry,
    /// token -> registration; a dual conduit appears under both its tokens.
    table: HashMap<Token, Entry>,
}

impl Reactor {
    /// Insert a freshly built transport and compute its initial interest.
    pub(crate) fn register_transport(
        &mut self,
        conduit: Conduit,
        transport: Arc<Transport>,
    ) -> io::Result<()> {
        self.hub.assert_selector_thread();
        let (rt, wt) = (transport.read_token, transport.write_token);
        debug!(?rt, ?wt, "registering transport");
        let reg = Rc::new(RefCell::new(Registered { conduit, transport }));
        self.table.insert(rt, Entry::Transport(reg.clone()));
        if wt != rt {
            self.table.insert(wt, Entry::Transport(reg.clone()));
        }
        self.update_entry(&reg)
    }

    pub(crate) fn install_hook(
        &mut self,
        token: Token,
        interest: Interest,
        mut hook: Box<dyn ReadyHook>,
    ) -> io::Result<()> {
        self.hub.assert_selector_thread();
        self.registry
            .register(&mut DynSource(hook.source()), token, interest)?;
        self.table.insert(token, Entry::Hook(Rc::new(RefCell::new(hook))));
        Ok(())
    }

    /// Recompute interest for whichever of the two tokens still resolves.
    /// Both may have departed if the transport was aborted in the meantime.
    pub(crate) fn update_tokens(&mut self, rt: Token, wt: Token) -> io::Result<()> {
        let entry = self
            .table
            .get(&rt)
            .or_else(|| self.table.get(&wt))
            .cloned();
        match entry {
            Some(Entry::Transport(reg)) => self.update_entry(&reg),
            _ => {
                trace!(?rt, ?wt, "reregister for a departed transport");
                Ok(())
            }
        }
    }

    /// Half-close the read side of `t`, requested from an arbitrary thread.
    pub(crate) fn close_read_for(&mut self, t: &Arc<Transport>) -> io::Result<()> {
        let entry = self
            .table
            .get(&t.read_token)
            .or_else(|| self.table.get(&t.write_token))
            .cloned();
        match entry {
            Some(Entry::Transport(reg)) => self.close_read_entry(&reg),
            _ => Ok(()),
        }
    }

    fn update_entry(&mut self, reg: &Rc<RefCell<Registered>>) -> io::Result<()> {
        self.hub.assert_selector_thread();
        let mut r = reg.borrow_mut();
        let Registered { conduit, transport } = &mut *r;
        conduit.reregister(&self.registry, transport)
    }

    fn close_read_entry(&mut self, reg: &Rc<RefCell<Registered>>) -> io::Result<()> {
        self.hub.assert_selector_thread();
        let gone = {
            let mut r = reg.borrow_mut();
            let Registered { conduit, transport } = &mut *r;
            conduit.close_read(&self.registry, transport)?
        };
        if let Some(token) = gone {
            debug!(?token, "read side closed");
            self.table.remove(&token);
        }
        Ok(())
    }

    fn close_write_entry(&mut self, reg: &Rc<RefCell<Registered>>) -> io::Result<()> {
        self.hub.assert_selector_thread();
        let gone = {
            let mut r = reg.borrow_mut();
            let Registered { conduit, transport } = &mut *r;
            conduit.close_write(&self.registry, transport)?
        };
        if let Some(token) = gone {
            debug!(?token, "write side closed");
            self.table.remove(&token);
        }
        Ok(())
    }

    /// Tear the transport down from the selector thread: close both halves
    /// ignoring I/O failures, then sequence the terminal callback behind
    /// whatever packets were already dispatched on the lane.
    pub(crate) fn abort(&mut self, reg: &Rc<RefCell<Registered>>, err: TransportError) {
        self.hub.assert_selector_thread();
        if let Err(e) = self.close_read_entry(reg) {
            debug!(error = %e, "close of read side failed during abort");
        }
        if let Err(e) = self.close_write_entry(reg) {
            debug!(error = %e, "close of write side failed during abort");
        }
        let t = reg.borrow().transport.clone();
        let t2 = t.clone();
        t.lane.submit(Box::new(move || {
            if !t2.terminated.swap(true, Ordering::SeqCst) {
                if let Some(receiver) = t2.receiver.get() {
                    receiver.terminate(err);
                }
            }
            t2.clear_owner();
        }));
    }

    pub(crate) fn abort_all(&mut self, err: TransportError) {
        let mut seen: Vec<Rc<RefCell<Registered>>> = Vec::new();
        for entry in self.table.values() {
            if let Entry::Transport(reg) = entry {
                if !seen.iter().any(|s| Rc::ptr_eq(s, reg)) {
                    seen.push(reg.clone());
                }
            }
        }
        for reg in seen {
            self.abort(&reg, err.clone());
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let entry = match self.table.get(&event.token()) {
            Some(entry) => entry.clone(),
            None => {
                // Registration cancelled earlier in this batch.
                trace!(token = ?event.token(), "event for a departed registration");
                return;
            }
        };
        match entry {
            Entry::Hook(hook) => hook.borrow_mut().ready(&self.registry, event),
            Entry::Transport(reg) => self.service(&reg, event),
        }
    }

    fn service(&mut self, reg: &Rc<RefCell<Registered>>, event: &Event) {
        let t = reg.borrow().transport.clone();
        let outcome: io::Result<()> = (|| {
            if event.is_readable() && self.pump_read(reg, &t)? {
                // Aborted inside the read pump; nothing left to service.
                return Ok(());
            }
            if event.is_writable() {
                self.pump_write(reg, &t)?;
            }
            self.update_entry(reg)
        })();
        if let Err(e) = outcome {
            warn!(error = %e, "communication problem; aborting transport");
            self.abort(reg, TransportError::from(e));
        }
    }

    /// Readable branch. Pulls wire bytes into `rb` and reassembles packets
    /// until the source would block, reports EOF, or the buffer overflows.
    /// Readiness is edge-style, so stopping early because the buffer was
    /// momentarily full would lose the remaining socket bytes; the loop
    /// pulls again whenever reassembly freed room.
    ///
    /// Returns `true` when the transport aborted (command overflow).
    fn pump_read(&mut self, reg: &Rc<RefCell<Registered>>, t: &Arc<Transport>) -> io::Result<bool> {
        loop {
            if !reg.borrow().conduit.r_open() {
                return Ok(false);
            }
            let n = {
                let mut r = reg.borrow_mut();
                let reader = match r.conduit.reader() {
                    Some(reader) => reader,
                    None => return Ok(false),
                };
                t.rb.receive(reader)?
            };
            let full = t.rb.writable() == 0;

            if n < 0 {
                self.close_read_entry(reg)?;
            }
            drain_packets(t);

            if t.rb.writable() == 0 && t.rb.readable() > 0 && t.rb.at_limit() {
                let buffered = t.rb.readable() as usize;
                warn!(
                    buffered,
                    "command buffer overflow; read bytes still too small for a single command"
                );
                // To avoid an infinite hang, abort this connection.
                self.abort(reg, TransportError::Overflow { buffered });
                return Ok(true);
            }

            if n < 0 {
                break;
            }
            if !full {
                // Stopped on would-block; the socket is drained for now.
                break;
            }
        }

        if t.rb.is_closed() {
            // EOF. Processed in sequence with the packets before it; an EOF
            // while the owning channel already closes locally is expected.
            let t2 = t.clone();
            t.lane.submit(Box::new(move || {
                if !t2.owner_is_closing() && !t2.terminated.swap(true, Ordering::SeqCst) {
                    if let Some(receiver) = t2.receiver.get() {
                        receiver.terminate(TransportError::UnexpectedEof);
                    }
                }
                t2.clear_owner();
            }));
        }
        Ok(false)
    }

    /// Writable branch. Flushes `wb` into the handle; once the buffer
    /// reports drained-and-closed, half-close the write side.
    fn pump_write(&mut self, reg: &Rc<RefCell<Registered>>, t: &Arc<Transport>) -> io::Result<()> {
        let n = {
            let mut r = reg.borrow_mut();
            let writer = match r.conduit.writer() {
                Some(writer) => writer,
                None => return Ok(()),
            };
            t.wb.send(writer)?
        };
        if n < 0 {
            debug!("write buffer drained and closed; half-closing");
            self.close_write_entry(reg)?;
        }
        Ok(())
    }
}

/// Reassemble every complete packet currently in `rb` and submit each to
/// the transport's lane in arrival order.
pub(crate) fn drain_packets(t: &Arc<Transport>) {
    scan_packets(&t.rb, &mut |packet| {
        let t2 = t.clone();
        t.lane.submit(Box::new(move || {
            if let Some(receiver) = t2.receiver.get() {
                receiver.handle(packet);
            }
        }));
    });
}

/// Scan `rb` without consuming speculatively: peek chunk headers forward
/// until a whole packet (terminated by a last-chunk) is visible, consume
/// exactly that packet, emit it, and continue. A partial packet, or a
/// half-present header, is left intact for the next readiness event.
pub(crate) fn scan_packets(rb: &FifoBuffer, emit: &mut dyn FnMut(Vec<u8>)) {
    let mut hdr = [0u8; CHUNK_HEADER_SIZE];
    let mut pos = 0usize;
    let mut packet_size = 0usize;
    loop {
        if rb.peek(pos, &mut hdr) < CHUNK_HEADER_SIZE {
            break; // not enough buffered to parse the next header
        }
        let header = ChunkHeader::parse(hdr);
        pos += CHUNK_HEADER_SIZE + header.len();
        packet_size += header.len();
        if header.is_last() && pos as isize <= rb.readable() {
            // The whole packet is buffered; read it in.
            let mut packet = vec![0u8; packet_size];
            let mut filled = 0;
            loop {
                let n = rb.read_non_blocking(&mut hdr);
                debug_assert_eq!(n, CHUNK_HEADER_SIZE);
                let chunk = ChunkHeader::parse(hdr);
                let n = rb.read_non_blocking(&mut packet[filled..filled + chunk.len()]);
                debug_assert_eq!(n, chunk.len());
                filled += chunk.len();
                if chunk.is_last() {
                    break;
                }
            }
            debug_assert_eq!(filled, packet_size);
            emit(packet);
            pos = 0;
            packet_size = 0;
        }
    }
}

/// Adapter so a `&mut dyn Source` can be handed to the registry, which
/// wants a sized source.
struct DynSource<'a>(&'a mut dyn Source);

impl Source for DynSource<'_> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.0.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.0.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_shared::ChunkHeader;

    fn collect(rb: &FifoBuffer) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        scan_packets(rb, &mut |p| packets.push(p));
        packets
    }

    fn feed_chunk(rb: &FifoBuffer, payload: &[u8], has_more: bool) {
        rb.write(&ChunkHeader::pack(payload.len(), has_more)).unwrap();
        rb.write(payload).unwrap();
    }

    #[test]
    fn test_scan_single_packet() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, b"hello", false);
        assert_eq!(collect(&rb), vec![b"hello".to_vec()]);
        assert_eq!(rb.readable(), 0);
    }

    #[test]
    fn test_scan_multi_chunk_packet() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, &[0, 1, 2, 3], true);
        feed_chunk(&rb, &[4, 5, 6, 7], true);
        feed_chunk(&rb, &[8, 9], false);
        assert_eq!(collect(&rb), vec![vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]]);
    }

    #[test]
    fn test_scan_multiple_packets_in_order() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, b"first", false);
        feed_chunk(&rb, b"second", false);
        feed_chunk(&rb, b"third", false);
        assert_eq!(
            collect(&rb),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_scan_refuses_half_present_header() {
        let rb = FifoBuffer::new(64, 1024);
        let header = ChunkHeader::pack(5, false);
        rb.write(&header[..1]).unwrap();
        assert!(collect(&rb).is_empty());
        assert_eq!(rb.readable(), 1); // untouched

        rb.write(&header[1..]).unwrap();
        rb.write(b"hello").unwrap();
        assert_eq!(collect(&rb), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_scan_preserves_partial_packet() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, b"done", false);
        // Second packet: header promises 7 bytes, only 3 arrived.
        rb.write(&ChunkHeader::pack(7, false)).unwrap();
        rb.write(b"par").unwrap();

        assert_eq!(collect(&rb), vec![b"done".to_vec()]);
        assert_eq!(rb.readable(), 2 + 3);

        rb.write(b"tial").unwrap();
        assert_eq!(collect(&rb), vec![b"partial".to_vec()]);
    }

    #[test]
    fn test_scan_full_chunk_plus_empty_terminator() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, &[9, 9, 9, 9], true);
        feed_chunk(&rb, &[], false);
        assert_eq!(collect(&rb), vec![vec![9, 9, 9, 9]]);
    }

    #[test]
    fn test_scan_empty_message() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, &[], false);
        assert_eq!(collect(&rb), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_scan_waits_for_last_chunk() {
        let rb = FifoBuffer::new(64, 1024);
        feed_chunk(&rb, b"half", true);
        assert!(collect(&rb).is_empty());
        assert_eq!(rb.readable(), 6);

        feed_chunk(&rb, b"done", false);
        assert_eq!(collect(&rb), vec![b"halfdone".to_vec()]);
    }
}
