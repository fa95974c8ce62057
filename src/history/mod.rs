//! Per-user error history

pub mod query;
pub mod store;

pub use query::{HistoryQuery, HistoryStatistics};
pub use store::HistoryStore;
