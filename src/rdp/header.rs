//! The 8-byte RDP header and the EACK payload it can be followed by.
//!
//! The header is appended after the user payload rather than prepended
//! before it — `rdp_add_header` writes it at `data[length]` before
//! sending, and `rdp_strip_header` truncates `length` by the header size
//! after parsing, exactly as the original C implementation lays packets
//! out on the wire.
//!
//! Wire layout, 8 bytes total: `flags(1) | rdp_length(1) | reserved(2) |
//! seq_nr(2, big-endian) | ack_nr(2, big-endian)`. The five boolean fields
//! are bits 0-4 of the flags byte.

use crate::packet::Packet;

pub const HEADER_LEN: usize = 8;

const FLAG_SYN: u8 = 0b0000_0001;
const FLAG_ACK: u8 = 0b0000_0010;
const FLAG_EAK: u8 = 0b0000_0100;
const FLAG_RST: u8 = 0b0000_1000;
const FLAG_NUL: u8 = 0b0001_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdpHeader {
    pub syn: bool,
    pub ack: bool,
    pub eak: bool,
    pub rst: bool,
    pub nul: bool,
    /// Declared payload length. Informational: the authoritative length is
    /// the packet's own byte count after the header is stripped (see
    /// `DESIGN.md`'s resolution of the "authoritative rdp_length" open
    /// question).
    pub rdp_length: u8,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl RdpHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut flags = 0u8;
        if self.syn {
            flags |= FLAG_SYN;
        }
        if self.ack {
            flags |= FLAG_ACK;
        }
        if self.eak {
            flags |= FLAG_EAK;
        }
        if self.rst {
            flags |= FLAG_RST;
        }
        if self.nul {
            flags |= FLAG_NUL;
        }

        let mut buf = [0u8; HEADER_LEN];
        buf[0] = flags;
        buf[1] = self.rdp_length;
        // buf[2..4] reserved, left zeroed.
        buf[4..6].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[6..8].copy_from_slice(&self.ack_nr.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> RdpHeader {
        let flags = bytes[0];
        RdpHeader {
            syn: flags & FLAG_SYN != 0,
            ack: flags & FLAG_ACK != 0,
            eak: flags & FLAG_EAK != 0,
            rst: flags & FLAG_RST != 0,
            nul: flags & FLAG_NUL != 0,
            rdp_length: bytes[1],
            seq_nr: u16::from_be_bytes([bytes[4], bytes[5]]),
            ack_nr: u16::from_be_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Appends this 8-byte header to the end of `data`.
    pub fn append_to(&self, packet: &mut Packet) {
        packet.data.extend_from_slice(&self.encode());
    }

    /// Strips the trailing 8-byte header. Returns `None` if the packet is
    /// too short to contain one. Any EACK payload precedes the header and
    /// is left in `packet.data` for the caller to parse separately.
    pub fn strip_from(packet: &mut Packet) -> Option<RdpHeader> {
        if packet.data.len() < HEADER_LEN {
            return None;
        }
        let split_at = packet.data.len() - HEADER_LEN;
        let tail = packet.data.split_off(split_at);
        let mut fixed = [0u8; HEADER_LEN];
        fixed.copy_from_slice(&tail);
        Some(Self::decode(&fixed))
    }
}

/// Encodes a list of out-of-order sequence numbers as a packed big-endian
/// `u16` list, the EACK payload format.
pub fn encode_eack(seqnos: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(seqnos.len() * 2);
    for s in seqnos {
        buf.extend_from_slice(&s.to_be_bytes());
    }
    buf
}

/// Decodes a packed big-endian `u16` list. Trailing odd bytes (a malformed
/// payload) are ignored.
pub fn decode_eack(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Id, IdFlags};

    fn test_id() -> Id {
        Id::new(0, 1, 2, 10, 11, IdFlags::RDP)
    }

    #[test]
    fn header_round_trips_through_a_packet() {
        let mut packet = Packet::unpooled(test_id(), b"hello".to_vec());
        let header = RdpHeader {
            syn: true,
            ack: true,
            seq_nr: 42,
            ack_nr: 7,
            rdp_length: 5,
            ..Default::default()
        };
        header.append_to(&mut packet);
        assert_eq!(packet.data.len(), 5 + HEADER_LEN);

        let parsed = RdpHeader::strip_from(&mut packet).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(packet.data, b"hello");
    }

    #[test]
    fn strip_rejects_undersized_packet() {
        let mut packet = Packet::unpooled(test_id(), vec![0u8; 3]);
        assert!(RdpHeader::strip_from(&mut packet).is_none());
    }

    #[test]
    fn eack_payload_round_trips() {
        let seqnos = vec![5u16, 6, 9, 0xFFFF];
        let encoded = encode_eack(&seqnos);
        assert_eq!(encoded.len(), seqnos.len() * 2);
        assert_eq!(decode_eack(&encoded), seqnos);
    }
}
