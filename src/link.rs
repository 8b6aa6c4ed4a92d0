//! The downward datagram contract, and an in-memory reference link used to
//! drive the state machine end to end in tests without a real CAN bus.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Mutex;

use crate::error::CspError;
use crate::packet::Packet;

/// Downward contract: hand a packet to the link layer for transmission.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, packet: Packet) -> Result<(), CspError>;
}

/// A duplex in-memory link connecting exactly two stacks, for integration
/// tests. Each `LoopbackLink` endpoint sends into the peer's queue and
/// receives from its own.
pub struct LoopbackLink {
    tx: Sender<Packet>,
    rx: Mutex<Receiver<Packet>>,
}

impl LoopbackLink {
    /// Builds a connected pair: packets sent on `a` arrive on `b.recv()`
    /// and vice versa.
    pub fn pair() -> (LoopbackLink, LoopbackLink) {
        let (tx_a, rx_a) = std::sync::mpsc::channel();
        let (tx_b, rx_b) = std::sync::mpsc::channel();
        (
            LoopbackLink {
                tx: tx_a,
                rx: Mutex::new(rx_b),
            },
            LoopbackLink {
                tx: tx_b,
                rx: Mutex::new(rx_a),
            },
        )
    }

    /// Non-blocking poll for the next inbound packet.
    pub fn try_recv(&self) -> Option<Packet> {
        match self.rx.lock().unwrap().try_recv() {
            Ok(packet) => Some(packet),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks up to `timeout` for the next inbound packet.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Packet> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}

impl DatagramSink for LoopbackLink {
    fn send_datagram(&self, packet: Packet) -> Result<(), CspError> {
        self.tx.send(packet).map_err(|_| CspError::Tx)
    }
}

/// A link that always refuses transmission, for exercising `CspError::Tx`
/// propagation out of the send path.
pub struct BrokenLink;

impl DatagramSink for BrokenLink {
    fn send_datagram(&self, _packet: Packet) -> Result<(), CspError> {
        Err(CspError::Tx)
    }
}
