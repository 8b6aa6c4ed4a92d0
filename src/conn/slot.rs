//! A single connection-table slot: the coarse lifecycle (is this slot in
//! use, and by which identity) plus the RDP sub-state it carries while
//! open.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::conn::options::ConnOptions;
use crate::conn::queue::BoundedQueue;
use crate::error::CspError;
use crate::id::Id;
use crate::packet::Packet;
use crate::rdp::L4;
use crate::sync::TimedLock;

/// How long `rdp_lock` may be held waited-for before the acquisition is
/// treated as a deadlock, per `spec.md` §5.
pub const RDP_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLifecycle {
    /// Not handed out by the table; available for `new`/`connect`.
    Free,
    /// Handed out; `id_in`/`id_out` and the RDP sub-state are valid.
    Allocated,
}

/// Fields protected by the per-connection lock (`conn.lock`): lifecycle,
/// identity, the accept-queue handoff latch, and the options the
/// connection was opened with.
pub struct ConnMeta {
    pub lifecycle: SlotLifecycle,
    pub id_in: Id,
    pub id_out: Id,
    /// Set once this connection has been posted to (and pulled from) a
    /// listener's accept queue, so later OPEN-state data does not post it a
    /// second time. `spec.md` §4.4 posts on first data-in-OPEN, not on the
    /// handshake itself.
    pub handed_out: bool,
    /// The listening port this connection was passively created under, if
    /// any. `None` for a connection created by an active `connect()`.
    /// Doubles as the gate for `handed_out`'s two behaviors: deferred
    /// accept-queue posting, and reaping a never-accepted connection after
    /// `conn_timeout` (`spec.md` §4.2, §8 scenario 6).
    pub listener_port: Option<u8>,
    pub opts: ConnOptions,
    pub open_timestamp: Instant,
}

impl Default for ConnMeta {
    fn default() -> Self {
        ConnMeta {
            lifecycle: SlotLifecycle::Free,
            id_in: Id::new(0, 0, 0, 0, 0, crate::id::IdFlags::empty()),
            id_out: Id::new(0, 0, 0, 0, 0, crate::id::IdFlags::empty()),
            handed_out: false,
            listener_port: None,
            opts: ConnOptions::default(),
            open_timestamp: Instant::now(),
        }
    }
}

/// One connection-table slot.
///
/// `meta` (`conn.lock`) and `l4` (`rdp_lock`) are deliberately separate
/// locks: `meta` is touched briefly by `find`/`close`/accept-queue
/// bookkeeping, while `l4` is held across an entire segment-processing or
/// send call and is therefore the one subject to deadlock-detection
/// timeouts.
pub struct Conn {
    pub meta: Mutex<ConnMeta>,
    pub l4: TimedLock<Option<L4>>,
    pub rx_queue: BoundedQueue<Packet>,
}

impl Conn {
    pub fn new(rx_queue_length: usize) -> Self {
        Conn {
            meta: Mutex::new(ConnMeta::default()),
            l4: TimedLock::new(None),
            rx_queue: BoundedQueue::new(rx_queue_length),
        }
    }

    /// Acquires `rdp_lock` with the standard deadlock-detection timeout.
    pub fn lock_l4(&self) -> Result<parking_lot::MutexGuard<'_, Option<L4>>, CspError> {
        self.l4.acquire(RDP_LOCK_TIMEOUT)
    }

    pub fn is_free(&self) -> bool {
        self.meta.lock().lifecycle == SlotLifecycle::Free
    }
}
