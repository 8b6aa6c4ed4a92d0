//! Reference packet buffer pool.
//!
//! `spec.md` treats the packet pool as an external collaborator: a
//! fixed-count, fixed-size set of reusable slots with O(1) allocate/release.
//! Rust's allocator already reuses freed heap memory, so the pool here
//! enforces the *count* ceiling rather than literally recycling a byte
//! buffer — the same approach the physical frame allocator in
//! `brianmayclone-anyos` takes for frames, adapted from a static bitmap to a
//! simple atomic-ish counter guarded by a lock, since this pool is shared
//! across threads rather than owned by a single kernel.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::id::Id;

/// A single packet: a protocol identity plus payload bytes.
///
/// The RDP header is appended to the *end* of `data` on send and stripped
/// from the end on receive, matching the wire layout in `spec.md` §6 (the
/// header sits after the user payload, not before it).
pub struct Packet {
    pub id: Id,
    pub data: Vec<u8>,
    /// Set when a packet is queued for retransmission; informational only,
    /// `length` is derived from `data.len()`.
    pub timestamp_ms: u64,
    pool: Option<Arc<PoolInner>>,
}

impl Packet {
    /// Builds a packet with no pool backing it (used by tests and by code
    /// paths that synthesize packets outside of a pool, such as header
    /// construction before queueing).
    pub fn unpooled(id: Id, data: Vec<u8>) -> Self {
        Packet {
            id,
            data,
            timestamp_ms: 0,
            pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

impl Clone for Packet {
    /// Clones are unpooled: a clone does not hold a slot of its own pool's
    /// capacity, since doing so without taking a fresh `allocate()` call
    /// would silently exceed the pool's count ceiling.
    fn clone(&self) -> Self {
        Packet {
            id: self.id,
            data: self.data.clone(),
            timestamp_ms: self.timestamp_ms,
            pool: None,
        }
    }
}

/// Contract implemented by a fixed-capacity packet allocator.
pub trait PacketPool: Send + Sync {
    /// Reserves a slot and returns an empty packet with `reserve` bytes of
    /// spare capacity, or `None` if every slot is in use.
    fn allocate(&self, id: Id, reserve: usize) -> Option<Packet>;

    /// Number of slots currently in use.
    fn in_use(&self) -> usize;

    /// Total number of slots.
    fn capacity(&self) -> usize;
}

struct PoolInner {
    in_use: Mutex<usize>,
    capacity: usize,
}

impl PoolInner {
    fn release(&self) {
        let mut in_use = self.in_use.lock();
        debug_assert!(*in_use > 0);
        *in_use = in_use.saturating_sub(1);
    }
}

/// A fixed-slot-count packet pool. Each `allocate` that succeeds reserves
/// one of `capacity` slots; the slot is returned automatically when the
/// `Packet` (or every clone descending from the original `allocate` call)
/// is dropped.
pub struct SlabPacketPool {
    inner: Arc<PoolInner>,
}

impl SlabPacketPool {
    pub fn new(capacity: usize) -> Self {
        SlabPacketPool {
            inner: Arc::new(PoolInner {
                in_use: Mutex::new(0),
                capacity,
            }),
        }
    }
}

impl PacketPool for SlabPacketPool {
    fn allocate(&self, id: Id, reserve: usize) -> Option<Packet> {
        let mut in_use = self.inner.in_use.lock();
        if *in_use >= self.inner.capacity {
            return None;
        }
        *in_use += 1;
        drop(in_use);
        Some(Packet {
            id,
            data: Vec::with_capacity(reserve),
            timestamp_ms: 0,
            pool: Some(self.inner.clone()),
        })
    }

    fn in_use(&self) -> usize {
        *self.inner.in_use.lock()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
