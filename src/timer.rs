//! The periodic timeout driver (`spec.md` §4.2): a caller-driven sweep of
//! every allocated connection, retransmitting unacked data, failing
//! connections that never completed their handshake, and reclaiming slots
//! that finished their `CLOSE_WAIT` linger.
//!
//! This crate does not spawn its own background thread — a systems-style
//! deployment drives `Stack::run_timeout_sweep` from its own periodic task
//! or timer interrupt, matching the collaborator boundary `spec.md` draws
//! around the link/scheduler layer.

use std::time::Duration;

/// Default interval a caller should drive `run_timeout_sweep` at.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
