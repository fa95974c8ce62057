//! Safety and cleanup
//!
//! Run-scoped scratch directories released on every exit path.

pub mod workspace;
