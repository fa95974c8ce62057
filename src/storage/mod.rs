//! Persistence for process-lifetime state
//!
//! Durable stores write JSON snapshots with temp-file-then-rename; in-memory
//! stores keep nothing across restarts.

pub mod snapshot;

pub use snapshot::{write_atomic, SnapshotFile};
