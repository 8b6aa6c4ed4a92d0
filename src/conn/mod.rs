//! The connection table and the per-slot connection object it manages.

pub mod options;
pub mod queue;
pub mod slot;
pub mod table;

pub use options::{ConnOptions, StackConfig};
pub use slot::Conn;
pub use table::ConnTable;
