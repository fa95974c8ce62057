use crate::config::types::{ExecutionLimits, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the boundary's root process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    /// Killed by the supervisor at the wall deadline
    TimedOut,
}

/// What the supervisor did to bring the process group down
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Raw result of one boundary run, before classification
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryOutcome {
    pub exit: ExitKind,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Either stream exceeded the output cap
    pub truncated: bool,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    /// Peak resident set in bytes (0 when unavailable)
    pub memory_peak: u64,
    pub kill_report: Option<KillReport>,
}

impl BoundaryOutcome {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Isolation seam between the sandbox and whatever actually runs the code.
///
/// `spawn` must not block on the snippet. `wait_or_kill` must return no later
/// than `timeout` plus a bounded grace period, killing the run if needed, and
/// must release everything the handle owns on every path.
pub trait IsolatedExecutionBoundary: Send + Sync {
    type Handle: Send;

    fn spawn(&self, code: &str, limits: &ExecutionLimits) -> Result<Self::Handle>;

    fn wait_or_kill(&self, handle: Self::Handle, timeout: Duration) -> Result<BoundaryOutcome>;

    /// Short label for logs and audit records
    fn describe(&self) -> String {
        "boundary".to_string()
    }
}
