//! The RDP transition table: builds and consumes header-bearing packets and
//! advances a connection's `L4` sub-state in response to local calls
//! (`connect`, `send`, `close`) and inbound segments.
//!
//! ```text
//! CLOSED --connect()--> SYN_SENT --recv SYN+ACK, send ACK--> OPEN
//! CLOSED --recv SYN (listener), send SYN+ACK--> SYN_RCVD --recv ACK--> OPEN
//! OPEN --recv RST, or close()+send RST--> CLOSE_WAIT --timeout--> CLOSED
//! ```

use crate::id::Id;
use crate::packet::Packet;

use super::header::{decode_eack, encode_eack, RdpHeader};
use super::seq;
use super::state::RdpState;
use super::L4;

/// Everything that falls out of processing one inbound segment or one
/// local call: packets that must be handed to the link, and any payload
/// bytes now ready for delivery to the connection's receive queue.
#[derive(Default)]
pub struct Outcome {
    pub to_send: Vec<Packet>,
    pub deliver: Vec<Vec<u8>>,
    /// Set when the segment drove the connection into `CLOSE_WAIT`/`CLOSED`
    /// and the caller's next operation should observe `CspError::Reset`.
    pub reset: bool,
}

fn header_for(l4: &L4, syn: bool, ack: bool, eak: bool, rst: bool, nul: bool) -> RdpHeader {
    RdpHeader {
        syn,
        ack,
        eak,
        rst,
        nul,
        rdp_length: 0,
        seq_nr: l4.snd.nxt,
        ack_nr: seq_prev(l4.rcv.cur),
    }
}

fn seq_prev(s: u16) -> u16 {
    s.wrapping_sub(1)
}

/// An inbound ack_nr is acceptable against our own send space iff it acks
/// something we've actually sent (`< snd.nxt`) and isn't so stale it
/// predates anything still representable in the window
/// (`>= snd.una - 1 - 2W`), per `spec.md` §4.3's `SYN_RCVD, OPEN` row.
fn ack_in_range(l4: &L4, ack_nr: u16) -> bool {
    let span = 2 * l4.window_size;
    let lower = l4.snd.una.wrapping_sub(1).wrapping_sub(span);
    seq::lt(ack_nr, l4.snd.nxt) && seq::ge(ack_nr, lower)
}

fn rst_reply(l4: &mut L4, id_out: Id, out: &mut Outcome) {
    l4.state = RdpState::CloseWait;
    out.reset = true;
    let rst = header_for(l4, false, false, false, true, false);
    out.to_send.push(make_packet(id_out, Vec::new(), rst, None));
}

fn make_packet(id_out: Id, payload: Vec<u8>, header: RdpHeader, eack: Option<&[u16]>) -> Packet {
    let mut packet = Packet::unpooled(id_out, payload);
    if let Some(seqnos) = eack {
        packet.data.extend(encode_eack(seqnos));
    }
    header.append_to(&mut packet);
    packet
}

/// Begins an active open: `CLOSED -> SYN_SENT`, returning the SYN to send.
pub fn connect(l4: &mut L4, id_out: Id) -> Packet {
    debug_assert_eq!(l4.state, RdpState::Closed);
    l4.state = RdpState::SynSent;
    l4.touch();
    let mut header = header_for(l4, true, false, false, false, false);
    header.rdp_length = 0;
    l4.snd.nxt = seq::next(l4.snd.nxt);
    make_packet(id_out, Vec::new(), header, None)
}

/// Rebuilds and resends the original SYN for a connect retry: same
/// `seq_nr` as the first attempt (`snd.iss`), since this is a
/// retransmission of the same handshake attempt, not a new one.
pub fn resend_syn(l4: &mut L4, id_out: Id) -> Packet {
    debug_assert_eq!(l4.state, RdpState::SynSent);
    l4.touch();
    let header = RdpHeader {
        syn: true,
        ack: false,
        eak: false,
        rst: false,
        nul: false,
        rdp_length: 0,
        seq_nr: l4.snd.iss,
        ack_nr: seq_prev(l4.rcv.cur),
    };
    make_packet(id_out, Vec::new(), header, None)
}

/// Marks a slot as passively listening for an incoming SYN.
pub fn listen(l4: &mut L4) {
    l4.state = RdpState::Listen;
    l4.touch();
}

/// Sends one segment of user data. Caller must already have confirmed the
/// connection is `OPEN` and the retransmit window has room.
pub fn send_data(l4: &mut L4, id_out: Id, payload: Vec<u8>) -> Packet {
    debug_assert_eq!(l4.state, RdpState::Open);
    let seq_nr = l4.snd.nxt;
    let mut header = header_for(l4, false, true, false, false, false);
    header.seq_nr = seq_nr;
    header.rdp_length = payload.len() as u8;
    let packet = make_packet(id_out, payload.clone(), header, None);
    l4.tx_queue.push(seq_nr, Packet::unpooled(id_out, packet.data.clone()));
    l4.snd.nxt = seq::next(l4.snd.nxt);
    l4.touch();
    packet
}

/// Initiates a local close: sends `RST` and moves to `CLOSE_WAIT`
/// regardless of the current state, short-circuiting straight to `CLOSED`
/// if the connection never left `LISTEN`/`CLOSED`.
pub fn close(l4: &mut L4, id_out: Id) -> Option<Packet> {
    match l4.state {
        RdpState::Closed | RdpState::Listen => {
            l4.state = RdpState::Closed;
            None
        }
        _ => {
            let header = header_for(l4, false, false, false, true, false);
            l4.state = RdpState::CloseWait;
            l4.touch();
            Some(make_packet(id_out, Vec::new(), header, None))
        }
    }
}

/// Processes one inbound header-bearing segment and advances the state
/// machine accordingly.
/// `remaining` is whatever bytes the packet carried after the header was
/// stripped: the EACK sequence-number list when `header.eak` is set, the
/// user payload otherwise. The two are mutually exclusive on the wire — an
/// EACK control segment carries no user data.
pub fn handle_segment(
    l4: &mut L4,
    id_out: Id,
    header: RdpHeader,
    remaining: Vec<u8>,
) -> Outcome {
    let mut out = Outcome::default();
    l4.touch();

    if header.rst {
        l4.state = RdpState::CloseWait;
        out.reset = true;
        return out;
    }

    match l4.state {
        RdpState::Listen => {
            if header.syn {
                l4.rcv.irs = header.seq_nr;
                l4.rcv.cur = seq::next(header.seq_nr);
                l4.state = RdpState::SynRcvd;
                let synack = header_for(l4, true, true, false, false, false);
                l4.snd.nxt = seq::next(l4.snd.nxt);
                out.to_send.push(make_packet(id_out, Vec::new(), synack, None));
            } else {
                // Unsolicited ACK or other segment while LISTEN: reply
                // RST and close, per spec.md §4.3 / §8 scenario 5.
                rst_reply(l4, id_out, &mut out);
            }
        }
        RdpState::SynSent => {
            if header.syn && header.ack && header.ack_nr == l4.snd.iss {
                l4.rcv.irs = header.seq_nr;
                l4.rcv.cur = seq::next(header.seq_nr);
                l4.snd.una = seq::next(l4.snd.una);
                l4.state = RdpState::Open;
                l4.tx_wait.signal();
                let ack = header_for(l4, false, true, false, false, false);
                out.to_send.push(make_packet(id_out, Vec::new(), ack, None));
            } else if header.ack && !header.syn {
                // ACK only: reply RST and wake the blocked connect() call.
                rst_reply(l4, id_out, &mut out);
                l4.tx_wait.signal();
            } else {
                // Anything else (bad SYN+ACK, bare SYN, RST already
                // handled above) closes without a reply.
                l4.state = RdpState::CloseWait;
                out.reset = true;
                l4.tx_wait.signal();
            }
        }
        RdpState::SynRcvd => {
            if header.ack && !header.syn && header.ack_nr == l4.snd.iss {
                l4.snd.una = seq::next(l4.snd.una);
                l4.state = RdpState::Open;
                l4.tx_wait.signal();
            } else {
                rst_reply(l4, id_out, &mut out);
            }
        }
        RdpState::Open => {
            if header.syn || !header.ack || !ack_in_range(l4, header.ack_nr) {
                rst_reply(l4, id_out, &mut out);
            } else {
                handle_open_segment(l4, id_out, header, remaining, &mut out);
            }
        }
        RdpState::CloseWait | RdpState::Closed => {}
    }

    out
}

fn handle_open_segment(
    l4: &mut L4,
    id_out: Id,
    header: RdpHeader,
    remaining: Vec<u8>,
    out: &mut Outcome,
) {
    if header.ack {
        let removed = l4.tx_queue.ack_through(header.ack_nr);
        if removed > 0 {
            l4.tx_wait.signal();
        }
    }

    if header.eak {
        for seq_nr in decode_eack(&remaining) {
            if l4.tx_queue.ack_one(seq_nr) {
                l4.tx_wait.signal();
            }
        }
        // EACK segments carry no user data.
        return;
    }

    if header.nul {
        // Keepalive: acked above, nothing else to do.
        return;
    }

    let payload = remaining;
    if payload.is_empty() {
        // Pure ack, nothing to deliver.
        return;
    }

    if header.seq_nr == l4.rcv.cur {
        out.deliver.push(payload);
        l4.rcv.cur = seq::next(l4.rcv.cur);
        // Draining the out-of-order bag: any buffered segments that are
        // now contiguous get delivered too.
        while l4.rcvd_seqno.contains(l4.rcv.cur) {
            l4.rcvd_seqno.remove(l4.rcv.cur);
            l4.rcv.cur = seq::next(l4.rcv.cur);
        }
        let ack = header_for(l4, false, true, false, false, false);
        out.to_send.push(make_packet(id_out, Vec::new(), ack, None));
    } else if seq::gt(header.seq_nr, l4.rcv.cur) {
        let upper = l4.rcv.cur.wrapping_add(2 * l4.window_size);
        if seq::le(header.seq_nr, upper) {
            if l4.rcvd_seqno.insert(header.seq_nr) {
                let seqnos = l4.rcvd_seqno.to_sorted_vec();
                let eack = header_for(l4, false, true, true, false, false);
                out.to_send
                    .push(make_packet(id_out, Vec::new(), eack, Some(&seqnos)));
            }
            // A full out-of-order bag silently drops the segment; the
            // peer's retransmission timer will resend it.
        }
        // else: beyond (rcv_cur, rcv_cur+2W], outside the receive window
        // and discarded outright rather than buffered.
    } else {
        // Duplicate of an already-delivered segment: re-ack.
        let ack = header_for(l4, false, true, false, false, false);
        out.to_send.push(make_packet(id_out, Vec::new(), ack, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::options::ConnOptions;
    use crate::id::IdFlags;

    fn ids() -> (Id, Id) {
        let a = Id::new(0, 2, 1, 20, 10, IdFlags::RDP);
        (a, a.reversed())
    }

    #[test]
    fn handshake_drives_both_sides_to_open() {
        let (id_ab, id_ba) = ids();
        let opts = ConnOptions::reliable();
        let mut client = L4::new(&opts, super::ACTIVE_ISS);
        let mut server = L4::new(&opts, super::PASSIVE_ISS);

        let syn = connect(&mut client, id_ab);
        assert_eq!(client.state, RdpState::SynSent);

        listen(&mut server);
        let syn_header = RdpHeader::decode(&{
            let mut buf = [0u8; 8];
            let start = syn.data.len() - 8;
            buf.copy_from_slice(&syn.data[start..]);
            buf
        });
        let out = handle_segment(&mut server, id_ba, syn_header, Vec::new());
        assert_eq!(server.state, RdpState::SynRcvd);
        assert_eq!(out.to_send.len(), 1);

        let synack_header = RdpHeader::decode(&{
            let mut buf = [0u8; 8];
            let pkt = &out.to_send[0];
            let start = pkt.data.len() - 8;
            buf.copy_from_slice(&pkt.data[start..]);
            buf
        });
        let out2 = handle_segment(&mut client, id_ab, synack_header, Vec::new());
        assert_eq!(client.state, RdpState::Open);
        assert_eq!(out2.to_send.len(), 1);

        let ack_header = RdpHeader::decode(&{
            let mut buf = [0u8; 8];
            let pkt = &out2.to_send[0];
            let start = pkt.data.len() - 8;
            buf.copy_from_slice(&pkt.data[start..]);
            buf
        });
        let out3 = handle_segment(&mut server, id_ba, ack_header, Vec::new());
        assert_eq!(server.state, RdpState::Open);
        assert!(out3.to_send.is_empty());
    }

    #[test]
    fn out_of_order_segment_is_buffered_then_drained() {
        let opts = ConnOptions::reliable();
        let (id_ab, id_ba) = ids();
        let mut server = L4::new(&opts, 1);
        server.state = RdpState::Open;
        server.rcv.cur = 10;
        server.rcv.irs = 9;

        let mut header = RdpHeader {
            ack: true,
            seq_nr: 11,
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, header, b"late".to_vec());
        assert!(out.deliver.is_empty());
        assert!(server.rcvd_seqno.contains(11));
        assert_eq!(server.rcv.cur, 10);

        header.seq_nr = 10;
        let out2 = handle_segment(&mut server, id_ba, header, b"first".to_vec());
        assert_eq!(out2.deliver, vec![b"first".to_vec(), b"late".to_vec()]);
        assert_eq!(server.rcv.cur, 12);
        assert!(!server.rcvd_seqno.contains(11));
        let _ = id_ab;
    }

    #[test]
    fn out_of_window_segment_is_discarded_not_buffered() {
        let opts = ConnOptions::reliable();
        let (_, id_ba) = ids();
        let mut server = L4::new(&opts, 1);
        server.state = RdpState::Open;
        server.rcv.cur = 10;

        // window_size defaults to 3, so the acceptable out-of-order range
        // is (10, 16]; 17 is one past it.
        let header = RdpHeader {
            ack: true,
            seq_nr: 17,
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, header, b"too-far".to_vec());
        assert!(out.deliver.is_empty());
        assert!(out.to_send.is_empty());
        assert!(!server.rcvd_seqno.contains(17));
    }

    #[test]
    fn listen_rejects_non_syn_segment_with_rst() {
        let opts = ConnOptions::reliable();
        let (_, id_ba) = ids();
        let mut server = L4::new(&opts, super::PASSIVE_ISS);
        listen(&mut server);

        let header = RdpHeader {
            ack: true,
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, header, Vec::new());
        assert_eq!(server.state, RdpState::CloseWait);
        assert!(out.reset);
        assert_eq!(out.to_send.len(), 1);
        assert!(RdpHeader::decode(&{
            let mut buf = [0u8; 8];
            let pkt = &out.to_send[0];
            buf.copy_from_slice(&pkt.data[pkt.data.len() - 8..]);
            buf
        })
        .rst);
    }

    #[test]
    fn syn_rcvd_rejects_ack_with_wrong_ack_nr() {
        let opts = ConnOptions::reliable();
        let (id_ab, _) = ids();
        let mut server = L4::new(&opts, super::PASSIVE_ISS);
        server.state = RdpState::SynRcvd;

        let header = RdpHeader {
            ack: true,
            ack_nr: super::PASSIVE_ISS.wrapping_add(1), // should be snd_iss
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ab, header, Vec::new());
        assert_eq!(server.state, RdpState::CloseWait);
        assert!(out.reset);
    }

    #[test]
    fn open_rejects_syn_and_out_of_range_ack() {
        let opts = ConnOptions::reliable();
        let (_, id_ba) = ids();
        let mut server = L4::new(&opts, 1);
        server.state = RdpState::Open;

        let syn_while_open = RdpHeader {
            syn: true,
            ack: true,
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, syn_while_open, Vec::new());
        assert_eq!(server.state, RdpState::CloseWait);
        assert!(out.reset);

        let mut server = L4::new(&opts, 1);
        server.state = RdpState::Open;
        let stale_ack = RdpHeader {
            ack: true,
            ack_nr: server.snd.nxt.wrapping_add(5), // acks data never sent
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, stale_ack, Vec::new());
        assert_eq!(server.state, RdpState::CloseWait);
        assert!(out.reset);
    }

    #[test]
    fn rst_moves_any_state_to_close_wait() {
        let opts = ConnOptions::reliable();
        let (_, id_ba) = ids();
        let mut server = L4::new(&opts, 1);
        server.state = RdpState::Open;
        let header = RdpHeader {
            rst: true,
            ..Default::default()
        };
        let out = handle_segment(&mut server, id_ba, header, Vec::new());
        assert_eq!(server.state, RdpState::CloseWait);
        assert!(out.reset);
    }
}
