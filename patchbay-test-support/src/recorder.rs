//! Receivers and owner flags that record what the hub does to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use patchbay_hub::{OwningChannel, Receiver, TransportError};

/// Receiver that records every packet and the terminal error.
#[derive(Default)]
pub struct CollectingReceiver {
    packets: Mutex<Vec<Vec<u8>>>,
    termination: Mutex<Option<TransportError>>,
}

impl CollectingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }

    pub fn termination(&self) -> Option<TransportError> {
        self.termination.lock().unwrap().clone()
    }

    /// Wait until at least `count` packets arrived.
    pub fn wait_for_packets(&self, count: usize, timeout: Duration) -> bool {
        crate::wait_until(timeout, || self.packets.lock().unwrap().len() >= count)
    }

    /// Wait for the terminal callback and return its error.
    pub fn wait_for_termination(&self, timeout: Duration) -> Option<TransportError> {
        crate::wait_until(timeout, || self.termination.lock().unwrap().is_some());
        self.termination()
    }
}

impl Receiver for CollectingReceiver {
    fn handle(&self, packet: Vec<u8>) {
        self.packets.lock().unwrap().push(packet);
    }

    fn terminate(&self, err: TransportError) {
        let mut slot = self.termination.lock().unwrap();
        // First terminal error wins; the contract says there is only one.
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// Owning-channel stand-in whose closing state tests flip directly.
#[derive(Default)]
pub struct OwnerFlag {
    closing: AtomicBool,
}

impl OwnerFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

impl OwningChannel for OwnerFlag {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
