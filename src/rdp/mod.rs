//! The RDP transport state machine: per-connection sequence-space
//! bookkeeping, the header/EACK wire codec, and the transition table that
//! drives a connection from `CLOSED` through `OPEN` and back.

pub mod header;
pub mod machine;
pub mod seq;
pub mod state;
pub mod window;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conn::options::ConnOptions;
use crate::sync::CountingSemaphore;

pub use state::RdpState;
pub use window::{RcvdBag, TxQueue};

/// Fixed initial sequence number for an active open (`connect()`).
/// `spec.md` §4.3 mandates a fixed small constant rather than a random
/// pick, so the wire sequence numbers in a handshake are reproducible
/// (see `spec.md` §8 scenario 1).
pub const ACTIVE_ISS: u16 = 100;

/// Fixed initial sequence number for a passive open (first inbound SYN on
/// a listening port).
pub const PASSIVE_ISS: u16 = 200;

/// Sliding-window sequence-space bookkeeping for one connection, split into
/// send- and receive-side halves for clarity (matching the split the
/// teacher's TCB module makes between its send- and receive-sequence-space
/// types).
pub struct SendSpace {
    /// Initial send sequence number chosen for this connection.
    pub iss: u16,
    /// Next sequence number to send.
    pub nxt: u16,
    /// Oldest unacknowledged sequence number.
    pub una: u16,
}

pub struct RecvSpace {
    /// Initial receive sequence number, learned from the peer's SYN.
    pub irs: u16,
    /// Next expected in-order sequence number.
    pub cur: u16,
}

/// The full RDP sub-state of one connection: lifecycle state, sequence
/// spaces, timers, the EACK bag, the retransmit queue, and the
/// window-full/connect-completion semaphore.
pub struct L4 {
    pub state: RdpState,
    pub snd: SendSpace,
    pub rcv: RecvSpace,
    pub window_size: u16,
    pub conn_timeout: Duration,
    pub packet_timeout: Duration,
    pub rcvd_seqno: RcvdBag,
    pub tx_queue: TxQueue,
    /// Wrapped in an `Arc` so a caller about to block on it (waiting for
    /// window space or for the handshake to complete) can clone the handle
    /// out and release `rdp_lock` *before* blocking — otherwise the
    /// incoming ack that would signal this semaphore could never acquire
    /// the same lock to be processed.
    pub tx_wait: Arc<CountingSemaphore>,
    pub last_activity: Instant,
}

impl L4 {
    pub fn new(opts: &ConnOptions, iss: u16) -> Self {
        L4 {
            state: RdpState::Closed,
            snd: SendSpace {
                iss,
                nxt: iss,
                una: iss,
            },
            rcv: RecvSpace { irs: 0, cur: 0 },
            window_size: opts.window_size,
            conn_timeout: opts.conn_timeout,
            packet_timeout: opts.packet_timeout,
            rcvd_seqno: RcvdBag::new(opts.window_size as usize * 2),
            tx_queue: TxQueue::new(opts.window_size as usize),
            tx_wait: Arc::new(CountingSemaphore::new(0)),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Drops every queued retransmit record. Used by a connect retry,
    /// which resends the original SYN rather than anything left over from
    /// the first attempt.
    pub fn reset_tx_queue(&mut self) {
        self.tx_queue = TxQueue::new(self.window_size as usize);
    }
}
