//! The fixed-capacity connection table: slot allocation, lookup by
//! identity, and the periodic timeout sweep.
//!
//! Slot allocation is round-robin: the table remembers where the last
//! successful allocation left off and resumes scanning from there, rather
//! than always starting from slot 0. This spreads reuse across the table
//! instead of favoring low-index slots, which is the variant `spec.md`
//! directs adopting (see `DESIGN.md`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::conn::options::{ConnOptions, StackConfig};
use crate::conn::slot::{Conn, SlotLifecycle};
use crate::error::CspError;
use crate::id::Id;
use crate::rdp::L4;

pub struct ConnTable {
    slots: Vec<Arc<Conn>>,
    /// Round-robin cursor: index to resume scanning from on the next
    /// `allocate` call. Guarded together with nothing else — this is the
    /// entirety of `conn_table_lock`'s job.
    next_slot: Mutex<usize>,
    next_eph_port: Mutex<u8>,
    config: StackConfig,
}

impl ConnTable {
    pub fn init(config: StackConfig) -> Self {
        let slots = (0..config.conn_max)
            .map(|_| Arc::new(Conn::new(config.rx_queue_length)))
            .collect();
        ConnTable {
            slots,
            next_slot: Mutex::new(0),
            next_eph_port: Mutex::new(crate::id::MAX_BIND_PORT + 1),
            config,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Looks up an existing, allocated connection whose `id_in` matches the
    /// address/port 4-tuple of an inbound packet's identity.
    pub fn find(&self, incoming: Id) -> Option<Arc<Conn>> {
        for conn in &self.slots {
            let meta = conn.meta.lock();
            if meta.lifecycle == SlotLifecycle::Allocated
                && meta.id_in.src() == incoming.src()
                && meta.id_in.dst() == incoming.dst()
                && meta.id_in.sport() == incoming.sport()
                && meta.id_in.dport() == incoming.dport()
            {
                return Some(conn.clone());
            }
        }
        None
    }

    /// Allocates the next free slot in round-robin order, starting from
    /// where the last allocation left off, and assigns it `id_in`/`id_out`.
    /// `iss` seeds the connection's initial sequence number; callers pass
    /// `rdp::ACTIVE_ISS` or `rdp::PASSIVE_ISS` depending on which side of
    /// the handshake is being opened (`spec.md` §4.3). Returns
    /// `CspError::NoMem` if every slot is in use.
    pub fn allocate(
        &self,
        id_in: Id,
        id_out: Id,
        opts: ConnOptions,
        iss: u16,
    ) -> Result<Arc<Conn>, CspError> {
        let n = self.slots.len();
        let mut cursor = self.next_slot.lock();
        for offset in 0..n {
            let idx = (*cursor + offset) % n;
            let conn = &self.slots[idx];
            let mut meta = conn.meta.lock();
            if meta.lifecycle == SlotLifecycle::Free {
                meta.lifecycle = SlotLifecycle::Allocated;
                meta.id_in = id_in;
                meta.id_out = id_out;
                meta.handed_out = false;
                meta.listener_port = None;
                meta.opts = opts;
                meta.open_timestamp = std::time::Instant::now();
                drop(meta);
                *cursor = (idx + 1) % n;
                *conn.lock_l4()? = Some(L4::new(&opts, iss));
                return Ok(conn.clone());
            }
        }
        Err(CspError::NoMem)
    }

    /// Releases a slot back to `Free`, clearing its RDP sub-state. The
    /// connection handle itself may still be held by a caller; subsequent
    /// operations on it must check `lifecycle` and return `CspError::Reset`.
    pub fn release(&self, conn: &Arc<Conn>) -> Result<(), CspError> {
        let mut meta = conn.meta.lock();
        meta.lifecycle = SlotLifecycle::Free;
        meta.handed_out = false;
        meta.listener_port = None;
        drop(meta);
        *conn.lock_l4()? = None;
        Ok(())
    }

    /// `true` if some other allocated slot already uses `port` as its own
    /// local (destination-on-inbound) port.
    fn sport_in_use(&self, port: u8) -> bool {
        self.slots.iter().any(|conn| {
            let meta = conn.meta.lock();
            meta.lifecycle == SlotLifecycle::Allocated && meta.id_in.dport() == port
        })
    }

    /// Allocates the next ephemeral source port in
    /// `(MAX_BIND_PORT, PORT_MAX]`, wrapping back to `MAX_BIND_PORT + 1`,
    /// skipping any port already in use as another connection's local
    /// port. Returns `CspError::NoMem` if the whole range is exhausted
    /// (`spec.md` §4.1 `connect()`: "wraparound with no free ephemeral
    /// returns failure").
    pub fn allocate_ephemeral_port(&self) -> Result<u8, CspError> {
        let mut cursor = self.next_eph_port.lock();
        let span = (crate::id::PORT_MAX - crate::id::MAX_BIND_PORT) as usize;
        let mut candidate = *cursor;
        for _ in 0..span {
            let next = if candidate >= crate::id::PORT_MAX {
                crate::id::MAX_BIND_PORT + 1
            } else {
                candidate + 1
            };
            if !self.sport_in_use(candidate) {
                *cursor = next;
                return Ok(candidate);
            }
            candidate = next;
        }
        Err(CspError::NoMem)
    }

    pub fn config(&self) -> StackConfig {
        self.config
    }

    /// Runs the periodic timeout driver once: for every allocated
    /// connection, checks `conn_timeout` (no activity since open while
    /// still handshaking) and `packet_timeout` (oldest unacked packet in
    /// the retransmit queue), returning the connections that need a
    /// retransmit or close action and the work to do.
    pub fn sweep_timeouts(&self) -> Vec<TimeoutAction> {
        let mut actions = Vec::new();
        for conn in &self.slots {
            let meta = conn.meta.lock();
            if meta.lifecycle != SlotLifecycle::Allocated {
                continue;
            }
            // A passively-created connection nobody ever accepted is
            // reaped once it's sat idle past `conn_timeout`, independent
            // of its RDP state (`spec.md` §4.2, §8 scenario 6).
            if meta.listener_port.is_some()
                && !meta.handed_out
                && meta.open_timestamp.elapsed() >= meta.opts.conn_timeout
            {
                actions.push(TimeoutAction::ReapClosed(conn.clone()));
                continue;
            }
            drop(meta);
            let Ok(l4_guard) = conn.l4.acquire(Duration::from_millis(50)) else {
                continue;
            };
            if let Some(l4) = l4_guard.as_ref() {
                use crate::rdp::RdpState;
                match l4.state {
                    RdpState::SynSent | RdpState::SynRcvd => {
                        if l4.idle_for() >= l4.conn_timeout {
                            actions.push(TimeoutAction::ConnectTimedOut(conn.clone()));
                        }
                    }
                    RdpState::Open => {
                        if let Some(front) = l4.tx_queue.iter().next() {
                            if front.last_sent.elapsed() >= l4.packet_timeout {
                                actions.push(TimeoutAction::Retransmit(conn.clone()));
                            }
                        }
                    }
                    RdpState::CloseWait => {
                        if l4.idle_for() >= l4.conn_timeout {
                            actions.push(TimeoutAction::ReapClosed(conn.clone()));
                        }
                    }
                    RdpState::Closed | RdpState::Listen => {}
                }
            }
        }
        actions
    }
}

pub enum TimeoutAction {
    ConnectTimedOut(Arc<Conn>),
    Retransmit(Arc<Conn>),
    ReapClosed(Arc<Conn>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdFlags;

    fn id(src: u8, dst: u8, sport: u8, dport: u8) -> Id {
        Id::new(0, dst, src, dport, sport, IdFlags::empty())
    }

    #[test]
    fn allocate_fails_once_table_is_full() {
        let table = ConnTable::init(StackConfig {
            conn_max: 2,
            ..Default::default()
        });
        let a = table.allocate(id(1, 0, 10, 20), id(0, 1, 20, 10), ConnOptions::default(), 100);
        let b = table.allocate(id(2, 0, 11, 21), id(0, 2, 21, 11), ConnOptions::default(), 100);
        assert!(a.is_ok());
        assert!(b.is_ok());
        let c = table.allocate(id(3, 0, 12, 22), id(0, 3, 22, 12), ConnOptions::default(), 100);
        assert_eq!(c.unwrap_err(), CspError::NoMem);
    }

    #[test]
    fn round_robin_spreads_allocations_across_slots() {
        let table = ConnTable::init(StackConfig {
            conn_max: 3,
            ..Default::default()
        });
        let first = table
            .allocate(id(1, 0, 10, 20), id(0, 1, 20, 10), ConnOptions::default(), 100)
            .unwrap();
        table.release(&first).unwrap();
        let second = table
            .allocate(id(2, 0, 11, 21), id(0, 2, 21, 11), ConnOptions::default(), 100)
            .unwrap();
        // The cursor moved past slot 0, so the next allocation should not
        // reuse the same physical slot as `first` even though it is free.
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn find_matches_on_address_and_port_tuple_only() {
        let table = ConnTable::init(StackConfig::default());
        let incoming = id(1, 0, 10, 20);
        table
            .allocate(incoming, incoming.reversed(), ConnOptions::default(), 100)
            .unwrap();
        assert!(table.find(incoming).is_some());
        assert!(table.find(id(9, 0, 10, 20)).is_none());
    }

    #[test]
    fn ephemeral_ports_stay_above_max_bind_port_and_wrap() {
        let table = ConnTable::init(StackConfig::default());
        for _ in 0..10 {
            let p = table.allocate_ephemeral_port().unwrap();
            assert!(p > crate::id::MAX_BIND_PORT);
        }
    }

    #[test]
    fn ephemeral_port_allocation_skips_ports_in_use() {
        let table = ConnTable::init(StackConfig::default());
        let first_port = table.allocate_ephemeral_port().unwrap();
        // Occupy that port as if a connection were using it as its local
        // (destination-on-inbound) port.
        table
            .allocate(
                id(1, 0, 0, first_port),
                id(0, 1, first_port, 0),
                ConnOptions::default(),
                100,
            )
            .unwrap();
        let next_port = table.allocate_ephemeral_port().unwrap();
        assert_ne!(first_port, next_port);
    }

    #[test]
    fn ephemeral_port_allocation_fails_once_range_is_exhausted() {
        let table = ConnTable::init(StackConfig {
            conn_max: 20,
            ..Default::default()
        });
        let span = (crate::id::PORT_MAX - crate::id::MAX_BIND_PORT) as u8;
        for i in 0..span {
            let port = crate::id::MAX_BIND_PORT + 1 + i;
            table
                .allocate(id(1, 0, 0, port), id(0, 1, port, 0), ConnOptions::default(), 100)
                .unwrap();
        }
        assert_eq!(
            table.allocate_ephemeral_port().unwrap_err(),
            CspError::NoMem
        );
    }
}
