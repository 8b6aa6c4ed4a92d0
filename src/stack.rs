//! `Stack`: the process-lifetime singleton context object that owns the
//! connection table, the ephemeral port counter, and the datagram link.
//!
//! `spec.md`'s Design Notes call for exactly this shape in a systems-
//! language port: "a singleton context object threaded through... or a
//! process-lifetime static with explicit init." This crate takes the
//! explicit-object route so tests can run two independent stacks side by
//! side over a shared `LoopbackLink`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, info, warn};

use crate::conn::options::{ConnOptions, StackConfig};
use crate::conn::slot::SlotLifecycle;
use crate::conn::table::TimeoutAction;
use crate::conn::{Conn, ConnTable};
use crate::error::CspError;
use crate::id::{Id, IdFlags};
use crate::link::DatagramSink;
use crate::packet::Packet;
use crate::rdp::header::RdpHeader;
use crate::rdp::{machine, RdpState, ACTIVE_ISS, PASSIVE_ISS};

/// A connection handle handed out to callers: the table slot plus the
/// identity the stack allocated it under.
pub type ConnHandle = Arc<Conn>;

struct Listener {
    queue: crate::conn::queue::BoundedQueue<ConnHandle>,
    opts: ConnOptions,
}

/// Listener lookups key on a one-byte port, so a faster non-cryptographic
/// hasher (as the pack's simulator uses for its protocol-id tables) is a
/// better fit than the default `RandomState`.
type FxDashMap<K, V> = DashMap<K, V, FxBuildHasher>;

pub struct Stack {
    my_address: u8,
    table: ConnTable,
    link: Arc<dyn DatagramSink>,
    listeners: FxDashMap<u8, Arc<Listener>>,
}

impl Stack {
    pub fn new(config: StackConfig, link: Arc<dyn DatagramSink>) -> Self {
        Stack {
            my_address: config.my_address,
            table: ConnTable::init(config),
            link,
            listeners: DashMap::default(),
        }
    }

    pub fn my_address(&self) -> u8 {
        self.my_address
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    /// Registers a listener on `port`, returning a handle the caller polls
    /// with [`Stack::accept`]. Binding a port already outside the listener
    /// range, or re-binding one already in use, is rejected. `opts`
    /// governs every connection passively created under this listener
    /// (window size, timeouts, reliability).
    pub fn listen(&self, port: u8, backlog: usize, opts: ConnOptions) -> Result<(), CspError> {
        if port > crate::id::MAX_BIND_PORT {
            return Err(CspError::Inval);
        }
        if self.listeners.contains_key(&port) {
            return Err(CspError::Inval);
        }
        self.listeners.insert(
            port,
            Arc::new(Listener {
                queue: crate::conn::queue::BoundedQueue::new(backlog),
                opts,
            }),
        );
        info!(port, "listening");
        Ok(())
    }

    /// Blocks up to `timeout` for an inbound connection on `port`.
    pub fn accept(&self, port: u8, timeout: Duration) -> Result<ConnHandle, CspError> {
        let listener = self.listeners.get(&port).ok_or(CspError::Inval)?.clone();
        listener.queue.pop_timeout(timeout).ok_or(CspError::TimedOut)
    }

    /// Actively opens a reliable connection to `(dst, dport)`, blocking up
    /// to `opts.conn_timeout` for the handshake to complete. The initial
    /// SYN is sent once; if no reply arrives within `conn_timeout`, it is
    /// resent exactly once more (`spec.md` §4.3 "Active connect", §8
    /// "exactly two SYNs are observed on the wire") before giving up.
    pub fn connect(&self, dst: u8, dport: u8, opts: ConnOptions) -> Result<ConnHandle, CspError> {
        if dport > crate::id::PORT_MAX {
            return Err(CspError::Inval);
        }
        let sport = self.table.allocate_ephemeral_port()?;
        let flags = if opts.reliable {
            IdFlags::RDP
        } else {
            IdFlags::empty()
        };
        let id_out = Id::new(0, dst, self.my_address, dport, sport, flags);
        let id_in = id_out.reversed();
        let conn = self.table.allocate(id_in, id_out, opts, ACTIVE_ISS)?;

        let syn = {
            let mut guard = conn.lock_l4()?;
            let l4 = guard.as_mut().expect("just allocated");
            machine::connect(l4, id_out)
        };
        self.link.send_datagram(syn).map_err(|_| CspError::Tx)?;

        let tx_wait = {
            let guard = conn.lock_l4()?;
            let l4 = guard.as_ref().expect("just allocated");
            l4.tx_wait.clone()
        };
        if tx_wait.wait_timeout(opts.conn_timeout) {
            return self.finish_connect(conn);
        }

        // First wait timed out with no reply: flush whatever's queued and
        // resend the original SYN once before giving up.
        let still_pending = {
            let guard = conn.lock_l4()?;
            guard.as_ref().map(|l4| l4.state == RdpState::SynSent).unwrap_or(false)
        };
        if still_pending {
            let retry_syn = {
                let mut guard = conn.lock_l4()?;
                let l4 = guard.as_mut().expect("still allocated");
                l4.reset_tx_queue();
                machine::resend_syn(l4, id_out)
            };
            self.link.send_datagram(retry_syn).map_err(|_| CspError::Tx)?;
            if tx_wait.wait_timeout(opts.conn_timeout) {
                return self.finish_connect(conn);
            }
        }

        // Failed for good: leave the slot allocated in whatever state the
        // state machine left it (CLOSE_WAIT if an RST arrived, SYN_SENT on
        // a plain timeout) rather than releasing it out from under a
        // caller that might still reference it.
        let reset = {
            let guard = conn.lock_l4()?;
            guard.as_ref().map(|l4| l4.state == RdpState::CloseWait).unwrap_or(false)
        };
        if reset {
            Err(CspError::Reset)
        } else {
            Err(CspError::TimedOut)
        }
    }

    fn finish_connect(&self, conn: ConnHandle) -> Result<ConnHandle, CspError> {
        let opened = {
            let guard = conn.lock_l4()?;
            guard.as_ref().map(|l4| l4.state == RdpState::Open).unwrap_or(false)
        };
        if opened {
            Ok(conn)
        } else {
            Err(CspError::Reset)
        }
    }

    /// Sends one segment of data on an open, reliable connection, blocking
    /// up to `opts.packet_timeout` if the retransmit window is full.
    pub fn send(&self, conn: &ConnHandle, data: Vec<u8>) -> Result<(), CspError> {
        let (id_out, packet_timeout) = {
            let meta = conn.meta.lock();
            if meta.lifecycle != SlotLifecycle::Allocated {
                return Err(CspError::Reset);
            }
            (meta.id_out, meta.opts.packet_timeout)
        };

        loop {
            let mut guard = conn.lock_l4()?;
            let l4 = guard.as_mut().ok_or(CspError::Reset)?;
            if l4.state != RdpState::Open {
                return Err(CspError::Reset);
            }
            if !l4.tx_queue.is_full() {
                let packet = machine::send_data(l4, id_out, data);
                drop(guard);
                self.link.send_datagram(packet).map_err(|_| CspError::Tx)?;
                return Ok(());
            }
            let tx_wait = l4.tx_wait.clone();
            drop(guard);
            if !tx_wait.wait_timeout(packet_timeout) {
                return Err(CspError::Busy);
            }
        }
    }

    /// Blocks up to `timeout` for the next delivered payload.
    pub fn recv(&self, conn: &ConnHandle, timeout: Duration) -> Result<Vec<u8>, CspError> {
        conn.rx_queue
            .pop_timeout(timeout)
            .map(|p| p.data)
            .ok_or(CspError::TimedOut)
    }

    /// Initiates a graceful close: sends `RST`, moves the connection to
    /// `CLOSE_WAIT`. The slot is reclaimed later by the timeout sweep.
    pub fn close(&self, conn: &ConnHandle) -> Result<(), CspError> {
        let id_out = conn.meta.lock().id_out;
        let mut guard = conn.lock_l4()?;
        if let Some(l4) = guard.as_mut() {
            if let Some(rst) = machine::close(l4, id_out) {
                drop(guard);
                self.link.send_datagram(rst).map_err(|_| CspError::Tx)?;
            }
        }
        Ok(())
    }

    /// The upward contract: hand one inbound packet to the stack for
    /// routing, segment processing, and delivery.
    pub fn deliver(&self, mut packet: Packet) -> Result<(), CspError> {
        let incoming_id = packet.id;
        let header = match RdpHeader::strip_from(&mut packet) {
            Some(h) => h,
            None => {
                warn!("dropped undersized packet");
                return Err(CspError::Inval);
            }
        };
        let remaining = std::mem::take(&mut packet.data);

        if let Some(conn) = self.table.find(incoming_id) {
            return self.deliver_to_existing(&conn, incoming_id, header, remaining);
        }

        if header.syn && !header.ack {
            return self.deliver_to_listener(incoming_id, header);
        }

        // No matching connection. If the destination port is a bound
        // listener, this is an unsolicited non-SYN segment (e.g. a bare
        // ACK) — spec.md §4.3/§8 scenario 5 calls for a bare RST reply
        // with no connection ever allocated. An RST provokes no reply, to
        // avoid an RST ping-pong.
        if !header.rst && self.listeners.contains_key(&incoming_id.dport()) {
            debug!(?incoming_id, "unsolicited segment to bound listener, replying RST");
            let rst_header = RdpHeader {
                rst: true,
                ..Default::default()
            };
            let mut packet = Packet::unpooled(incoming_id.reversed(), Vec::new());
            rst_header.append_to(&mut packet);
            self.link.send_datagram(packet).map_err(|_| CspError::Tx)?;
            return Ok(());
        }

        debug!(?incoming_id, "no matching connection for inbound packet");
        Ok(())
    }

    fn deliver_to_existing(
        &self,
        conn: &ConnHandle,
        incoming_id: Id,
        header: RdpHeader,
        remaining: Vec<u8>,
    ) -> Result<(), CspError> {
        let id_out = conn.meta.lock().id_out;
        let outcome = {
            let mut guard = conn.lock_l4()?;
            let l4 = guard.as_mut().ok_or(CspError::Reset)?;
            machine::handle_segment(l4, id_out, header, remaining)
        };
        for pkt in outcome.to_send {
            self.link.send_datagram(pkt).map_err(|_| CspError::Tx)?;
        }
        if !outcome.deliver.is_empty() {
            for data in outcome.deliver {
                let packet = Packet::unpooled(incoming_id, data);
                if conn.rx_queue.try_push(packet).is_err() {
                    warn!(?incoming_id, "receive queue full, dropping delivered segment");
                }
            }
            // Posted to the accept queue only on the first data delivered
            // in OPEN, per spec.md §4.4 — not at handshake completion.
            self.maybe_post_to_accept_queue(conn);
        }
        if outcome.reset {
            info!(?incoming_id, "connection reset by peer");
            let (listener_port, handed_out) = {
                let meta = conn.meta.lock();
                (meta.listener_port, meta.handed_out)
            };
            // A protocol error on a passively-created connection nobody
            // ever accepted is closed immediately; one already handed to
            // userspace is left in CLOSE_WAIT for explicit close.
            if listener_port.is_some() && !handed_out {
                self.table.release(conn)?;
            }
        }
        Ok(())
    }

    /// If `conn` is passively created, still owned by its listener's
    /// accept queue, and has user data ready, posts it there and latches
    /// `handed_out` so later data on the same connection is not re-posted.
    fn maybe_post_to_accept_queue(&self, conn: &ConnHandle) {
        let (port, already_posted) = {
            let meta = conn.meta.lock();
            (meta.listener_port, meta.handed_out)
        };
        let Some(port) = port else { return };
        if already_posted {
            return;
        }
        let Some(listener) = self.listeners.get(&port).map(|l| l.clone()) else {
            return;
        };
        if listener.queue.try_push(conn.clone()).is_ok() {
            conn.meta.lock().handed_out = true;
        } else {
            warn!(port, "accept backlog full, dropping connection handoff");
        }
    }

    fn deliver_to_listener(&self, incoming_id: Id, header: RdpHeader) -> Result<(), CspError> {
        let port = incoming_id.dport();
        let Some(listener) = self.listeners.get(&port).map(|l| l.clone()) else {
            debug!(port, "syn to unbound port, ignored");
            return Ok(());
        };

        let id_in = incoming_id;
        let id_out = incoming_id.reversed();
        let conn = self
            .table
            .allocate(id_in, id_out, listener.opts, PASSIVE_ISS)?;
        conn.meta.lock().listener_port = Some(port);
        let outcome = {
            let mut guard = conn.lock_l4()?;
            let l4 = guard.as_mut().expect("just allocated");
            machine::listen(l4);
            machine::handle_segment(l4, id_out, header, Vec::new())
        };
        for pkt in outcome.to_send {
            self.link.send_datagram(pkt).map_err(|_| CspError::Tx)?;
        }
        if outcome.reset {
            // The inbound SYN itself was malformed enough to bounce
            // straight to CLOSE_WAIT (shouldn't normally happen for a
            // well-formed SYN, but mirrors the same never-accepted rule).
            self.table.release(&conn)?;
        }
        Ok(())
    }

    /// Runs one pass of the periodic timeout driver over every connection.
    pub fn run_timeout_sweep(&self) {
        for action in self.table.sweep_timeouts() {
            match action {
                TimeoutAction::ConnectTimedOut(conn) => {
                    let _ = self.table.release(&conn);
                }
                TimeoutAction::Retransmit(conn) => {
                    let resend = {
                        if let Ok(mut guard) = conn.lock_l4() {
                            if let Some(l4) = guard.as_mut() {
                                l4.touch();
                                l4.tx_queue.iter_mut().next().map(|r| {
                                    r.last_sent = std::time::Instant::now();
                                    r.packet.data.clone()
                                })
                            } else {
                                None
                            }
                        } else {
                            None
                        }
                    };
                    if let Some(bytes) = resend {
                        let id_out = conn.meta.lock().id_out;
                        let packet = Packet::unpooled(id_out, bytes);
                        let _ = self.link.send_datagram(packet);
                    }
                }
                TimeoutAction::ReapClosed(conn) => {
                    let _ = self.table.release(&conn);
                }
            }
        }
    }
}
