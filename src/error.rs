//! Error kinds returned at every fallible public boundary.

use thiserror::Error;

/// Boundary error type, covering every failure mode described for the
/// connection table, the RDP state machine, and the packet pool/link
/// collaborators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CspError {
    /// An argument was out of range (bad port, bad window size, ...).
    #[error("invalid argument")]
    Inval,
    /// A fixed-capacity resource (connection slot, packet, queue slot) was
    /// exhausted.
    #[error("no memory available")]
    NoMem,
    /// A blocking call exceeded its deadline without completing.
    #[error("operation timed out")]
    TimedOut,
    /// The datagram link refused or failed to accept a packet for
    /// transmission.
    #[error("link transmit failed")]
    Tx,
    /// The connection was reset, locally or by the peer, and can no longer
    /// be used.
    #[error("connection reset")]
    Reset,
    /// A bounded queue was full and the caller's packet was dropped rather
    /// than blocking.
    #[error("resource busy")]
    Busy,
    /// `rdp_lock` could not be acquired within its deadlock-detection
    /// timeout.
    #[error("deadlock detected acquiring rdp lock")]
    Deadlock,
}

pub type Result<T> = std::result::Result<T, CspError>;
