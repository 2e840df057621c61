//! End-to-end tests driving the hub over real OS handles.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use patchbay_hub::mio::event::Event;
use patchbay_hub::mio::{Interest, Registry};
use patchbay_hub::{
    Hub, HubError, IoPair, ReadyHook, Transport, TransportConfig, TransportError, Wired,
};
use patchbay_shared::{Capability, Mode};
use patchbay_test_support::{
    frame_message, unframe_messages, wait_until, CollectingReceiver, FixedPool, OwnerFlag,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    hub: Arc<Hub>,
    runner: Option<JoinHandle<Result<(), HubError>>>,
}

impl Harness {
    fn start() -> Self {
        let hub = Hub::new(FixedPool::new(4)).unwrap();
        let runner = {
            let hub = hub.clone();
            thread::spawn(move || hub.run())
        };
        assert!(wait_until(TIMEOUT, || hub.is_running()));
        Self {
            hub,
            runner: Some(runner),
        }
    }

    fn shutdown(mut self) -> Result<(), HubError> {
        self.hub.close();
        self.runner.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.hub.close();
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

/// A connected loopback socket pair: (hub side, peer side).
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn wire_tcp(hub: &Arc<Hub>, stream: TcpStream, config: TransportConfig) -> Arc<Transport> {
    match hub
        .connect(IoPair::Tcp(stream), Mode::Binary, Capability::current(), config)
        .unwrap()
    {
        Wired::Transport(t) => t,
        Wired::Deferred { .. } => panic!("expected a hub-serviced transport"),
    }
}

fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn test_single_message_mono_tcp() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    peer.write_all(&[0x80, 0x05, b'h', b'e', b'l', b'l', b'o']).unwrap();

    assert!(rx.wait_for_packets(1, TIMEOUT));
    assert_eq!(rx.packets(), vec![b"hello".to_vec()]);

    // No further activity: exactly one packet, no terminal callback.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rx.packets().len(), 1);
    assert!(rx.termination().is_none());
}

#[test]
fn test_write_block_emits_chunked_wire_bytes() {
    let h = Harness::start();
    h.hub.set_frame_size(4);
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());

    t.write_block(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();

    assert_eq!(
        read_exactly(&mut peer, 16),
        vec![0x00, 0x04, 0, 1, 2, 3, 0x00, 0x04, 4, 5, 6, 7, 0x80, 0x02, 8, 9]
    );
}

#[test]
fn test_multiple_messages_arrive_in_order() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    let mut wire = Vec::new();
    wire.extend_from_slice(&frame_message(b"first", 4));
    wire.extend_from_slice(&frame_message(b"second", 4));
    wire.extend_from_slice(&frame_message(b"third", 4));
    peer.write_all(&wire).unwrap();

    assert!(rx.wait_for_packets(3, TIMEOUT));
    assert_eq!(
        rx.packets(),
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
}

#[test]
fn test_two_transports_stay_isolated() {
    let h = Harness::start();

    let (local_a, mut peer_a) = tcp_pair();
    let (local_b, mut peer_b) = tcp_pair();
    let ta = wire_tcp(&h.hub, local_a, TransportConfig::default());
    let tb = wire_tcp(&h.hub, local_b, TransportConfig::default());
    let rx_a = Arc::new(CollectingReceiver::new());
    let rx_b = Arc::new(CollectingReceiver::new());
    ta.setup(rx_a.clone());
    tb.setup(rx_b.clone());

    peer_a.write_all(&frame_message(b"A", 8192)).unwrap();
    peer_b.write_all(&frame_message(b"BB", 8192)).unwrap();

    assert!(rx_a.wait_for_packets(1, TIMEOUT));
    assert!(rx_b.wait_for_packets(1, TIMEOUT));
    assert_eq!(rx_a.packets(), vec![b"A".to_vec()]);
    assert_eq!(rx_b.packets(), vec![b"BB".to_vec()]);
}

#[test]
fn test_split_header_does_not_corrupt_reassembly() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    let wire = frame_message(b"hi", 8192);
    peer.write_all(&wire[..1]).unwrap();
    peer.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(rx.packets().is_empty());

    peer.write_all(&wire[1..]).unwrap();
    assert!(rx.wait_for_packets(1, TIMEOUT));
    assert_eq!(rx.packets(), vec![b"hi".to_vec()]);
}

#[test]
fn test_full_chunk_with_empty_terminator() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    // length == frame size with has-more, then a zero-length terminator.
    let mut wire = Vec::new();
    wire.extend_from_slice(&[0x00, 0x04, 9, 9, 9, 9]);
    wire.extend_from_slice(&[0x80, 0x00]);
    peer.write_all(&wire).unwrap();

    assert!(rx.wait_for_packets(1, TIMEOUT));
    assert_eq!(rx.packets(), vec![vec![9, 9, 9, 9]]);
}

#[test]
fn test_clean_eof_reports_unexpected_eof() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    peer.write_all(&frame_message(b"hello", 8192)).unwrap();
    peer.shutdown(Shutdown::Write).unwrap();

    let err = rx.wait_for_termination(TIMEOUT).expect("terminal callback");
    assert!(matches!(err, TransportError::UnexpectedEof));
    // The packet was sequenced before the terminal event.
    assert_eq!(rx.packets(), vec![b"hello".to_vec()]);
}

#[test]
fn test_eof_suppressed_while_locally_closing() {
    let h = Harness::start();
    let (local, peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    let owner = Arc::new(OwnerFlag::new());
    owner.set_closing();
    t.bind_owner(owner);
    t.setup(rx.clone());

    peer.shutdown(Shutdown::Write).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(rx.termination().is_none());
    assert!(rx.packets().is_empty());
}

#[test]
fn test_command_overflow_aborts_transport() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(
        &h.hub,
        local,
        TransportConfig {
            recv_buffer_limit: 64,
        },
    );
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    // A message that never ends: has-more chunks growing past the cap.
    let mut wire = Vec::new();
    wire.extend_from_slice(&patchbay_shared::ChunkHeader::pack(60, true));
    wire.extend_from_slice(&[0xAA; 60]);
    wire.extend_from_slice(&patchbay_shared::ChunkHeader::pack(60, true));
    wire.extend_from_slice(&[0xBB; 60]);
    peer.write_all(&wire).unwrap();

    let err = rx.wait_for_termination(TIMEOUT).expect("terminal callback");
    assert!(matches!(err, TransportError::Overflow { .. }));
    assert!(rx.packets().is_empty());
}

#[test]
fn test_backpressured_stream_delivers_everything_in_order() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i * 31 % 251) as u8).collect();

    let reader = thread::spawn(move || {
        let mut wire = Vec::new();
        peer.set_read_timeout(Some(TIMEOUT)).unwrap();
        peer.read_to_end(&mut wire).unwrap();
        wire
    });

    // Far more than the 256 KiB send cap; the writer rides backpressure
    // while the selector drains.
    t.write_block(&payload).unwrap();
    t.close_write();

    let wire = reader.join().unwrap();
    assert_eq!(unframe_messages(&wire), vec![payload]);
}

#[test]
fn test_local_close_read_is_quiet() {
    let h = Harness::start();
    let (local, mut peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    t.close_read();
    thread::sleep(Duration::from_millis(100));
    let _ = peer.write_all(&frame_message(b"ignored", 8192));

    thread::sleep(Duration::from_millis(200));
    assert!(rx.packets().is_empty());
    assert!(rx.termination().is_none());
}

#[test]
fn test_hub_close_aborts_registered_transports() {
    let h = Harness::start();
    let (local, _peer) = tcp_pair();
    let t = wire_tcp(&h.hub, local, TransportConfig::default());
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    assert!(h.shutdown().is_ok());

    let err = rx.wait_for_termination(TIMEOUT).expect("terminal callback");
    assert!(matches!(err, TransportError::HubClosed));
}

#[test]
fn test_connect_requires_running_hub() {
    let hub = Hub::new(FixedPool::new(1)).unwrap();
    let (local, _peer) = tcp_pair();
    let result = hub.connect(
        IoPair::Tcp(local),
        Mode::Binary,
        Capability::current(),
        TransportConfig::default(),
    );
    assert!(matches!(result, Err(HubError::NotRunning)));
}

#[test]
fn test_non_hub_connections_are_deferred() {
    let h = Harness::start();

    // Text mode peers are not serviced by the selector.
    let (local, _peer) = tcp_pair();
    let wired = h
        .hub
        .connect(
            IoPair::Tcp(local),
            Mode::Text,
            Capability::current(),
            TransportConfig::default(),
        )
        .unwrap();
    assert!(matches!(wired, Wired::Deferred { .. }));

    // Neither are peers without chunked framing.
    let (local, _peer) = tcp_pair();
    let wired = h
        .hub
        .connect(
            IoPair::Tcp(local),
            Mode::Binary,
            Capability::NONE,
            TransportConfig::default(),
        )
        .unwrap();
    assert!(matches!(wired, Wired::Deferred { .. }));

    // Unselectable streams come back untouched.
    let wired = h
        .hub
        .connect(
            IoPair::Legacy {
                r: Box::new(std::io::empty()),
                w: Box::new(std::io::sink()),
            },
            Mode::Binary,
            Capability::current(),
            TransportConfig::default(),
        )
        .unwrap();
    assert!(matches!(wired, Wired::Deferred { .. }));
}

#[cfg(unix)]
struct CountingHook {
    r: patchbay_hub::mio::unix::pipe::Receiver,
    hits: Arc<AtomicUsize>,
}

#[cfg(unix)]
impl ReadyHook for CountingHook {
    fn source(&mut self) -> &mut dyn patchbay_hub::mio::event::Source {
        &mut self.r
    }

    fn ready(&mut self, _registry: &Registry, _event: &Event) {
        let mut buf = [0u8; 64];
        while matches!(self.r.read(&mut buf), Ok(n) if n > 0) {}
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(unix)]
#[test]
fn test_ready_hook_receives_events() {
    use patchbay_hub::mio::unix::pipe;

    let h = Harness::start();
    let (mut tx, rx) = pipe::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    h.hub.install_hook(
        Interest::READABLE,
        Box::new(CountingHook {
            r: rx,
            hits: hits.clone(),
        }),
    );

    // Wait for the install task to land, then poke the pipe.
    thread::sleep(Duration::from_millis(100));
    pipe_write_all(&mut tx, b"ping");

    assert!(wait_until(TIMEOUT, || hits.load(Ordering::SeqCst) > 0));
}

#[cfg(unix)]
fn pipe_write_all(w: &mut patchbay_hub::mio::unix::pipe::Sender, mut data: &[u8]) {
    let deadline = Instant::now() + TIMEOUT;
    while !data.is_empty() {
        match w.write(data) {
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "pipe write stalled");
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => panic!("pipe write failed: {e}"),
        }
    }
}

#[cfg(unix)]
fn pipe_read_exactly(
    r: &mut patchbay_hub::mio::unix::pipe::Receiver,
    n: usize,
) -> Vec<u8> {
    let deadline = Instant::now() + TIMEOUT;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < n {
        match r.read(&mut buf) {
            Ok(0) => break,
            Ok(k) => out.extend_from_slice(&buf[..k]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "pipe read stalled");
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => panic!("pipe read failed: {e}"),
        }
    }
    out
}

#[cfg(unix)]
#[test]
fn test_dual_pipe_transport_round_trip() {
    use patchbay_hub::mio::unix::pipe;

    let h = Harness::start();
    // Inbound: peer writes tx_in, hub reads rx_in.
    let (mut tx_in, rx_in) = pipe::new().unwrap();
    // Outbound: hub writes tx_out, peer reads rx_out.
    let (tx_out, mut rx_out) = pipe::new().unwrap();

    let wired = h
        .hub
        .connect(
            IoPair::Pipe { r: rx_in, w: tx_out },
            Mode::Binary,
            Capability::current(),
            TransportConfig::default(),
        )
        .unwrap();
    let t = match wired {
        Wired::Transport(t) => t,
        Wired::Deferred { .. } => panic!("expected a hub-serviced transport"),
    };
    let rx = Arc::new(CollectingReceiver::new());
    t.setup(rx.clone());

    pipe_write_all(&mut tx_in, &frame_message(b"ping", 8192));
    assert!(rx.wait_for_packets(1, TIMEOUT));
    assert_eq!(rx.packets(), vec![b"ping".to_vec()]);

    t.write_block(b"pong").unwrap();
    assert_eq!(
        pipe_read_exactly(&mut rx_out, 6),
        vec![0x80, 0x04, b'p', b'o', b'n', b'g']
    );
}
