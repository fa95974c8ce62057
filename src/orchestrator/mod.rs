//! Analysis orchestration
//!
//! Composes detector and sandbox output, the explanation cache, the history
//! store and an explanation provider into one `analyze` call.

pub mod analyzer;
pub mod inflight;
pub mod maintenance;
pub mod provider;
pub mod retry;

pub use analyzer::{merge_errors, AnalysisEvent, AnalysisResult, Analyzer, ErrorWithExplanation};
pub use inflight::InFlight;
pub use maintenance::{run_maintenance, MaintenanceReport, Sweeper};
pub use provider::{fallback_explanation, ExplanationProvider, RuleBasedProvider};
pub use retry::{RetryOutcome, RetryPolicy};

use crate::cache::ExplanationCache;
use crate::config::config::ExplainboxConfig;
use crate::config::types::{ExecutionLimits, Result};
use crate::config::validator::validate_config;
use crate::core::{ProcessBoundary, Sandbox};
use crate::history::HistoryStore;
use crate::storage::SnapshotFile;
use std::sync::Arc;
use std::time::Duration;

/// Open the cache and history stores described by `config`.
///
/// A snapshot that cannot be read is reported and replaced by an empty
/// in-memory store, leaving the file on disk untouched.
pub fn open_stores(config: &ExplainboxConfig) -> (Arc<ExplanationCache>, Arc<HistoryStore>) {
    let cache = ExplanationCache::open(&config.cache, SnapshotFile::new(config.storage.cache_path()))
        .unwrap_or_else(|e| {
            maintenance::report_store_failure("cache", &e);
            ExplanationCache::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.default_ttl_secs),
            )
        });

    let history = HistoryStore::open(&config.history, SnapshotFile::new(config.storage.history_path()))
        .unwrap_or_else(|e| {
            maintenance::report_store_failure("history", &e);
            HistoryStore::new(config.history.top_k)
        });

    (Arc::new(cache), Arc::new(history))
}

/// Validate `config` and build a process-backed analyzer over the given stores
pub fn build_analyzer(
    config: &ExplainboxConfig,
    cache: Arc<ExplanationCache>,
    history: Arc<HistoryStore>,
    provider: Arc<dyn ExplanationProvider>,
) -> Result<Analyzer<ProcessBoundary>> {
    validate_config(config)?;
    let limits = ExecutionLimits::from_config(&config.sandbox)?;
    let boundary = ProcessBoundary::from_config(&config.sandbox)?;

    log::info!(
        "Analyzer ready: timeout={:?} memory_cap={} cpu_cap={:?} provider={}",
        limits.timeout,
        limits.memory_cap,
        limits.cpu_cap,
        provider.name()
    );

    Ok(Analyzer::new(
        Sandbox::new(boundary, limits),
        cache,
        history,
        provider,
        RetryPolicy::from_config(&config.provider),
    ))
}
