//! Loopback echo: two transports on one hub, one echoing the other.
//!
//! Run: cargo run --example echo

use std::net::{TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;

use patchbay::{Executor, Job};
use patchbay_hub::{Hub, IoPair, Receiver, Transport, TransportConfig, TransportError, Wired};
use patchbay_shared::{Capability, Mode};

/// Thread-per-job pool; enough for a demo.
struct Pool;

impl Executor for Pool {
    fn execute(&self, job: Job) {
        thread::spawn(job);
    }
}

/// Server side: write every packet straight back.
struct EchoBack {
    transport: Arc<Transport>,
}

impl Receiver for EchoBack {
    fn handle(&self, packet: Vec<u8>) {
        println!("server: echoing {} bytes", packet.len());
        let _ = self.transport.write_block(&packet);
    }

    fn terminate(&self, err: TransportError) {
        println!("server: terminated: {err}");
    }
}

/// Client side: forward echoed packets to the main thread.
struct Forward {
    done: mpsc::Sender<Vec<u8>>,
}

impl Receiver for Forward {
    fn handle(&self, packet: Vec<u8>) {
        let _ = self.done.send(packet);
    }

    fn terminate(&self, err: TransportError) {
        println!("client: terminated: {err}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hub = Hub::new(Arc::new(Pool))?;
    {
        let hub = hub.clone();
        thread::spawn(move || hub.run());
    }
    while !hub.is_running() {
        thread::yield_now();
    }

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;

    let server_t = must_wire(hub.connect(
        IoPair::Tcp(server),
        Mode::Binary,
        Capability::current(),
        TransportConfig::default(),
    )?);
    let client_t = must_wire(hub.connect(
        IoPair::Tcp(client),
        Mode::Binary,
        Capability::current(),
        TransportConfig::default(),
    )?);

    server_t.setup(Arc::new(EchoBack {
        transport: server_t.clone(),
    }));

    let (tx, rx) = mpsc::channel();
    client_t.setup(Arc::new(Forward { done: tx }));

    for msg in ["hello", "patchbay", "goodbye"] {
        client_t.write_block(msg.as_bytes())?;
        let echoed = rx.recv()?;
        println!("client: got back {:?}", String::from_utf8_lossy(&echoed));
    }

    hub.close();
    Ok(())
}

fn must_wire(wired: Wired) -> Arc<Transport> {
    match wired {
        Wired::Transport(t) => t,
        Wired::Deferred { .. } => unreachable!("loopback sockets are selectable"),
    }
}
