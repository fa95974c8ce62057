/// Core types and structures for the explainbox pipeline
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Source position of an error. `line` and `column` are 1-based; synthetic
/// errors that cannot be attributed to a location use line 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub length: u32,
}

impl Position {
    pub fn new(line: u32, column: u32, length: u32) -> Self {
        Self {
            line,
            column,
            length,
        }
    }

    /// Position used for errors that belong to the whole run (timeouts, crashes)
    pub fn unattributed() -> Self {
        Self::default()
    }
}

/// Error class - closed set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "syntax")]
    Syntax,
    #[serde(rename = "runtime")]
    Runtime,
    #[serde(rename = "warning")]
    Warning,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Warning => "warning",
        }
    }

    /// Detector output (syntax and warnings) sorts ahead of runtime output
    pub fn merge_rank(&self) -> u8 {
        match self {
            ErrorKind::Syntax | ErrorKind::Warning => 0,
            ErrorKind::Runtime => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error found in learner code. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub position: Position,
    pub kind: ErrorKind,
    /// Exception or classification name, e.g. `ZeroDivisionError`, `Timeout`
    pub name: String,
    pub raw_message: String,
    /// 16 hex characters, see [`crate::detect::signature`]
    pub signature: String,
    /// Source line the error points at (empty for unattributed errors)
    pub snippet: String,
}

impl Error {
    /// Build an error and derive its signature from the normalized inputs.
    pub fn new(
        kind: ErrorKind,
        name: impl Into<String>,
        raw_message: impl Into<String>,
        position: Position,
        snippet: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let raw_message = raw_message.into();
        let snippet = snippet.into();
        let signature =
            crate::detect::signature::derive_signature(kind, &name, &raw_message, &snippet);
        Self {
            position,
            kind,
            name,
            raw_message,
            signature,
            snippet,
        }
    }
}

/// Sandbox resource limits. All three primary limits are mandatory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall clock deadline for the whole run
    pub timeout: Duration,
    /// Address space cap in bytes
    pub memory_cap: u64,
    /// CPU time cap
    pub cpu_cap: Duration,
    /// Per-stream output cap in bytes
    pub max_output_bytes: usize,
    /// Largest file the snippet may create in scratch
    pub max_file_size: u64,
    /// Open file descriptor cap
    pub max_open_files: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            memory_cap: 256 * 1024 * 1024,
            cpu_cap: Duration::from_secs(3),
            max_output_bytes: 64 * 1024,
            max_file_size: 1024 * 1024,
            max_open_files: 64,
        }
    }
}

/// Result of one sandbox invocation. Request scoped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub stdout: String,
    pub errors: Vec<Error>,
    pub wall_time: Duration,
    /// Peak resident set in bytes (0 when unavailable)
    pub memory_peak: u64,
    pub outcome: OutcomeClass,
}

/// Sandbox outcome taxonomy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeClass {
    /// Snippet completed with exit code 0
    #[default]
    #[serde(rename = "OK")]
    Ok,
    /// Uncaught exception or non-zero exit
    #[serde(rename = "RE")]
    RuntimeError,
    /// Wall deadline or CPU cap reached
    #[serde(rename = "TLE")]
    Timeout,
    /// Memory cap reached
    #[serde(rename = "MLE")]
    MemoryLimit,
    /// Restricted resource access
    #[serde(rename = "SV")]
    Security,
    /// Killed by an unattributed signal or unreadable failure
    #[serde(rename = "CRASH")]
    Crashed,
    /// The boundary could not be started
    #[serde(rename = "IE")]
    BoundaryFailure,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Ok => "ok",
            OutcomeClass::RuntimeError => "runtime_error",
            OutcomeClass::Timeout => "timeout",
            OutcomeClass::MemoryLimit => "memory_limit",
            OutcomeClass::Security => "security",
            OutcomeClass::Crashed => "crashed",
            OutcomeClass::BoundaryFailure => "boundary_failure",
        }
    }
}

/// Explanation text for one error signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub error_name: String,
    pub explanation_text: String,
    pub suggested_fix: String,
}

/// Cache record, also the persisted cache format
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedExplanation {
    pub signature: String,
    pub error_name: String,
    #[serde(rename = "explanation")]
    pub explanation_text: String,
    pub suggested_fix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

impl CachedExplanation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn explanation(&self) -> Explanation {
        Explanation {
            error_name: self.error_name.clone(),
            explanation_text: self.explanation_text.clone(),
            suggested_fix: self.suggested_fix.clone(),
        }
    }
}

/// One row per (user_id, signature), also the persisted history format
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_id: String,
    pub signature: String,
    pub kind: ErrorKind,
    pub error_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub sample_snippet: String,
}

/// Custom error types for explainbox
#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Isolation boundary error: {0}")]
    Boundary(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for ExplainError {
    fn from(err: nix::errno::Errno) -> Self {
        ExplainError::Process(err.to_string())
    }
}

/// Failures reported by an external explanation provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,

    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => false,
        }
    }
}

/// Result type alias for explainbox operations
pub type Result<T> = std::result::Result<T, ExplainError>;
