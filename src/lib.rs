//! explainbox: sandboxed error analysis for learner code snippets
//!
//! A snippet is checked by a fast structural detector and executed inside a
//! resource-bounded boundary at the same time. The errors from both are
//! merged, recorded per user, and explained from a signature-keyed cache or
//! an external provider.
//!
//! # Architecture
//!
//! ## Detection ([`detect`])
//! - [`detect::lexer`]: Tokenizer for the snippet language
//! - [`detect::detector`]: Structural syntax errors with exact positions
//! - [`detect::signature`]: Deterministic error signatures
//!
//! ## Isolated Execution ([`core`], [`exec`])
//! - [`core::boundary`]: The `IsolatedExecutionBoundary` seam
//! - [`core::supervisor`]: Process boundary (spawn, deadline, group kill)
//! - [`core::runner`]: Guard runner installed next to the snippet
//! - [`core::sandbox`]: Execute and classify
//! - [`exec::preexec`]: Namespaces, rlimits and landlock applied before exec
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: Outcome class and learner-facing errors
//!
//! ## Shared State ([`cache`], [`history`], [`storage`])
//! - [`cache::explanation`]: TTL and capacity bounded explanation cache
//! - [`history::store`]: Per-user occurrence ledger
//! - [`storage::snapshot`]: Atomic JSON snapshots for the durable policy
//!
//! ## Orchestration ([`orchestrator`])
//! - [`orchestrator::analyzer`]: The `analyze` pipeline
//! - [`orchestrator::inflight`]: Single-flight provider calls
//! - [`orchestrator::retry`]: Provider retry policy
//! - [`orchestrator::maintenance`]: Background sweep and flush
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Counters and Prometheus export

// Detection
pub mod detect;

// Isolated execution
pub mod core;
pub mod exec;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Shared state
pub mod cache;
pub mod history;
pub mod storage;

// Orchestration
pub mod orchestrator;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the explainbox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;

pub use cache::{CacheStats, ExplanationCache};
pub use core::{IsolatedExecutionBoundary, ProcessBoundary, Sandbox};
pub use history::{HistoryQuery, HistoryStatistics, HistoryStore};
pub use orchestrator::{
    AnalysisEvent, AnalysisResult, Analyzer, ErrorWithExplanation, ExplanationProvider,
    RetryPolicy, RuleBasedProvider,
};
