//! Packed connection identity: priority, addresses, ports, and protocol flags.
//!
//! Mirrors the bitfield layout of libCSP's `csp_id_t`, packed into a single
//! `u32` so an `Id` is `Copy` and cheap to carry through the connection
//! table, the header codec, and log events.

use std::fmt;

const PRIO_SHIFT: u32 = 30;
const PRIO_BITS: u32 = 2;
const RESERVED_SHIFT: u32 = 26;
const RESERVED_BITS: u32 = 4;
const DST_SHIFT: u32 = 21;
const DST_BITS: u32 = 5;
const SRC_SHIFT: u32 = 16;
const SRC_BITS: u32 = 5;
const DPORT_SHIFT: u32 = 10;
const DPORT_BITS: u32 = 6;
const SPORT_SHIFT: u32 = 4;
const SPORT_BITS: u32 = 6;
const FLAGS_SHIFT: u32 = 0;
const FLAGS_BITS: u32 = 4;

fn mask(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

/// Highest representable address (5 bits).
pub const ADDRESS_MAX: u8 = (1 << DST_BITS) - 1;
/// Highest representable port number (6 bits).
pub const PORT_MAX: u8 = (1 << DPORT_BITS) - 1;
/// Highest port a listener may `bind` to; ports above this are ephemeral.
pub const MAX_BIND_PORT: u8 = 47;

/// A tiny hand-rolled bitflags macro, avoiding a dependency for four bits.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> $ty {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#06b})", stringify!($name), self.0)
            }
        }
    };
}

bitflags_like! {
    /// Per-packet protocol flags, carried in the low 4 bits of [`Id`].
    pub struct IdFlags: u8 {
        const RDP = 0b0001;
        const HMAC = 0b0010;
        const XTEA = 0b0100;
        const CRC32 = 0b1000;
    }
}

/// Packed connection identity used both as the wire-level 4-tuple and as the
/// connection table's lookup key.
///
/// Layout (MSB to LSB): `priority(2) | reserved(4) | dst(5) | src(5) |
/// dport(6) | sport(6) | flags(4)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(u32);

impl Id {
    pub fn new(priority: u8, dst: u8, src: u8, dport: u8, sport: u8, flags: IdFlags) -> Self {
        let mut raw = 0u32;
        raw |= (priority as u32 & mask(PRIO_BITS)) << PRIO_SHIFT;
        raw |= (dst as u32 & mask(DST_BITS)) << DST_SHIFT;
        raw |= (src as u32 & mask(SRC_BITS)) << SRC_SHIFT;
        raw |= (dport as u32 & mask(DPORT_BITS)) << DPORT_SHIFT;
        raw |= (sport as u32 & mask(SPORT_BITS)) << SPORT_SHIFT;
        raw |= (flags.bits() as u32 & mask(FLAGS_BITS)) << FLAGS_SHIFT;
        Id(raw)
    }

    pub fn priority(self) -> u8 {
        ((self.0 >> PRIO_SHIFT) & mask(PRIO_BITS)) as u8
    }

    pub fn dst(self) -> u8 {
        ((self.0 >> DST_SHIFT) & mask(DST_BITS)) as u8
    }

    pub fn src(self) -> u8 {
        ((self.0 >> SRC_SHIFT) & mask(SRC_BITS)) as u8
    }

    pub fn dport(self) -> u8 {
        ((self.0 >> DPORT_SHIFT) & mask(DPORT_BITS)) as u8
    }

    pub fn sport(self) -> u8 {
        ((self.0 >> SPORT_SHIFT) & mask(SPORT_BITS)) as u8
    }

    pub fn flags(self) -> IdFlags {
        IdFlags(((self.0 >> FLAGS_SHIFT) & mask(FLAGS_BITS)) as u8)
    }

    pub fn with_flags(self, flags: IdFlags) -> Self {
        let cleared = self.0 & !(mask(FLAGS_BITS) << FLAGS_SHIFT);
        Id(cleared | ((flags.bits() as u32) << FLAGS_SHIFT))
    }

    /// Swaps source/destination address and port, as when turning an
    /// incoming identity into the identity used to reply.
    pub fn reversed(self) -> Self {
        Id::new(
            self.priority(),
            self.src(),
            self.dst(),
            self.sport(),
            self.dport(),
            self.flags(),
        )
    }

    /// Whether `other` is the reply-identity counterpart of `self`: same
    /// address/port 4-tuple as would be produced by [`Id::reversed`].
    pub fn matches_reverse_of(self, other: Id) -> bool {
        self.dst() == other.src()
            && self.src() == other.dst()
            && self.dport() == other.sport()
            && self.sport() == other.dport()
    }

    pub const RESERVED_SHIFT: u32 = RESERVED_SHIFT;
    pub const RESERVED_BITS: u32 = RESERVED_BITS;
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Id")
            .field("priority", &self.priority())
            .field("dst", &self.dst())
            .field("src", &self.src())
            .field("dport", &self.dport())
            .field("sport", &self.sport())
            .field("flags", &self.flags())
            .finish()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src(),
            self.sport(),
            self.dst(),
            self.dport()
        )
    }
}
