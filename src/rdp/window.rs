//! Sliding-window bookkeeping: the EACK "received out of order" bag and the
//! retransmission queue.

use std::collections::VecDeque;
use std::time::Instant;

use crate::packet::Packet;

/// Fixed-capacity bag of out-of-order sequence numbers, used to build EACK
/// packets. Slots are `Option<u16>` rather than using `0` as an "empty"
/// sentinel, since `0` is itself a valid sequence number.
pub struct RcvdBag {
    slots: Vec<Option<u16>>,
}

impl RcvdBag {
    pub fn new(capacity: usize) -> Self {
        RcvdBag {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.slots.iter().any(|s| *s == Some(seq))
    }

    /// Inserts `seq` into the first free slot. Returns `false` if the bag
    /// is full and already lacks this sequence number.
    pub fn insert(&mut self, seq: u16) -> bool {
        if self.contains(seq) {
            return true;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(seq);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, seq: u16) {
        for slot in self.slots.iter_mut() {
            if *slot == Some(seq) {
                *slot = None;
            }
        }
    }

    /// Sequence numbers currently held, in ascending numeric order (not
    /// windowed order — callers encode these directly into an EACK
    /// payload, which does not need wraparound-aware sorting to be
    /// useful).
    pub fn to_sorted_vec(&self) -> Vec<u16> {
        let mut v: Vec<u16> = self.slots.iter().filter_map(|s| *s).collect();
        v.sort_unstable();
        v
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

/// A packet queued for possible retransmission, with the timestamp of its
/// last transmission.
pub struct TxRecord {
    pub seq_nr: u16,
    pub packet: Packet,
    pub last_sent: Instant,
}

/// Fixed-capacity (size `W`, the window size) retransmission queue, in
/// ascending sequence-number order.
pub struct TxQueue {
    capacity: usize,
    records: VecDeque<TxRecord>,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        TxQueue {
            capacity,
            records: VecDeque::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pushes a freshly sent packet. Caller must check `is_full` first.
    pub fn push(&mut self, seq_nr: u16, packet: Packet) {
        debug_assert!(!self.is_full());
        self.records.push_back(TxRecord {
            seq_nr,
            packet,
            last_sent: Instant::now(),
        });
    }

    /// Drops every record whose sequence number is covered by a
    /// cumulative ack of `ack_nr` (i.e. `seq_nr <= ack_nr` under windowed
    /// ordering), returning how many were removed.
    pub fn ack_through(&mut self, ack_nr: u16) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| super::seq::gt(r.seq_nr, ack_nr));
        before - self.records.len()
    }

    /// Drops exactly the record for `seq_nr`, if present (selective ack).
    pub fn ack_one(&mut self, seq_nr: u16) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.seq_nr != seq_nr);
        before != self.records.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TxRecord> {
        self.records.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxRecord> {
        self.records.iter()
    }

    pub fn front_seq(&self) -> Option<u16> {
        self.records.front().map(|r| r.seq_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Id, IdFlags};

    fn packet() -> Packet {
        Packet::unpooled(Id::new(0, 1, 2, 3, 4, IdFlags::empty()), vec![])
    }

    #[test]
    fn bag_tracks_capacity_and_membership() {
        let mut bag = RcvdBag::new(2);
        assert!(bag.insert(5));
        assert!(bag.insert(7));
        assert!(!bag.insert(9)); // full
        assert!(bag.contains(5));
        assert!(!bag.contains(9));
        bag.remove(5);
        assert!(bag.insert(9));
        assert_eq!(bag.to_sorted_vec(), vec![7, 9]);
    }

    #[test]
    fn bag_insert_is_idempotent() {
        let mut bag = RcvdBag::new(1);
        assert!(bag.insert(3));
        assert!(bag.insert(3));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn tx_queue_ack_through_drops_covered_records() {
        let mut q = TxQueue::new(4);
        for seq in [1u16, 2, 3, 4] {
            q.push(seq, packet());
        }
        assert_eq!(q.ack_through(2), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.front_seq(), Some(3));
    }

    #[test]
    fn tx_queue_selective_ack_drops_one_record() {
        let mut q = TxQueue::new(4);
        for seq in [1u16, 2, 3] {
            q.push(seq, packet());
        }
        assert!(q.ack_one(2));
        assert_eq!(q.len(), 2);
        assert!(!q.ack_one(2));
    }
}
