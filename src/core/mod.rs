//! Isolated execution
//!
//! The boundary seam, the process-backed boundary with its guard runner,
//! and the sandbox facade that classifies each run.

pub mod boundary;
pub mod runner;
pub mod sandbox;
pub mod supervisor;

pub use boundary::{BoundaryOutcome, ExitKind, IsolatedExecutionBoundary, KillReport};
pub use sandbox::Sandbox;
pub use supervisor::{ProcessBoundary, ProcessHandle};
