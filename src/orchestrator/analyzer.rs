/// Analysis pipeline
///
/// Runs the detector and the sandbox side by side, merges their errors,
/// records every error in the history store and attaches an explanation to
/// each one: cached when possible, from the provider otherwise.
use crate::cache::ExplanationCache;
use crate::config::types::{Error, ErrorKind, ExecutionResult, Explanation, OutcomeClass};
use crate::core::{IsolatedExecutionBoundary, Sandbox};
use crate::detect::detect;
use crate::history::HistoryStore;
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::orchestrator::inflight::{InFlight, Role};
use crate::orchestrator::provider::{fallback_explanation, ExplanationProvider};
use crate::orchestrator::retry::RetryPolicy;
use crate::verdict::classifier::{synthetic, CRASHED_ERROR};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// One merged error with the explanation attached to it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorWithExplanation {
    pub error: Error,
    pub explanation: Explanation,
    /// Served by a cache hit in this call
    pub cached: bool,
    /// Generic text used because the provider failed
    pub fallback: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub errors: Vec<ErrorWithExplanation>,
    /// Errors in `errors` whose explanation came from a cache hit in this
    /// call. Errors sharing a signature are looked up once, so this can exceed
    /// the number of hits the cache itself records.
    pub cached_count: usize,
    pub elapsed: Duration,
    pub outcome: OutcomeClass,
    pub stdout: String,
    pub succeeded: bool,
}

/// Progress callback payload
#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisEvent {
    /// Every merged error, before any explanation is attached
    ErrorsDetected(Vec<Error>),
    /// Explanation for `errors[index]`
    Explained {
        index: usize,
        explanation: Explanation,
        cached: bool,
    },
}

struct Resolved {
    explanation: Explanation,
    fallback: bool,
}

struct ActiveAnalysis;

impl ActiveAnalysis {
    fn enter() -> Self {
        get_metrics().active_analyses.inc();
        Self
    }
}

impl Drop for ActiveAnalysis {
    fn drop(&mut self) {
        get_metrics().active_analyses.dec();
    }
}

pub struct Analyzer<B: IsolatedExecutionBoundary> {
    sandbox: Sandbox<B>,
    cache: Arc<ExplanationCache>,
    history: Arc<HistoryStore>,
    provider: Arc<dyn ExplanationProvider>,
    retry: RetryPolicy,
    inflight: InFlight,
}

impl<B: IsolatedExecutionBoundary> Analyzer<B> {
    pub fn new(
        sandbox: Sandbox<B>,
        cache: Arc<ExplanationCache>,
        history: Arc<HistoryStore>,
        provider: Arc<dyn ExplanationProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sandbox,
            cache,
            history,
            provider,
            retry,
            inflight: InFlight::new(),
        }
    }

    pub fn sandbox(&self) -> &Sandbox<B> {
        &self.sandbox
    }

    pub fn cache(&self) -> &Arc<ExplanationCache> {
        &self.cache
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn analyze(&self, code: &str, user_id: &str) -> AnalysisResult {
        self.analyze_with_progress(code, user_id, &|_| {})
    }

    /// Analyze `code` for `user_id`. `progress` receives `ErrorsDetected`
    /// first and then one `Explained` per error, in completion order.
    pub fn analyze_with_progress(
        &self,
        code: &str,
        user_id: &str,
        progress: &dyn Fn(AnalysisEvent),
    ) -> AnalysisResult {
        let metrics = get_metrics();
        metrics.analyses_total.inc();
        let _active = ActiveAnalysis::enter();
        let started = Instant::now();

        let (detected, execution) = self.detect_and_execute(code, user_id);
        let errors = merge_errors(detected, execution.errors);

        for error in &errors {
            self.history.record(user_id, error);
        }
        progress(AnalysisEvent::ErrorsDetected(errors.clone()));

        let mut explained: Vec<Option<(Explanation, bool, bool)>> = vec![None; errors.len()];
        let mut cached_count = 0;
        let mut misses: Vec<Vec<usize>> = Vec::new();

        for indices in group_by_signature(&errors) {
            let signature = &errors[indices[0]].signature;
            match self.cache.get(signature) {
                Some(explanation) => {
                    for &index in &indices {
                        cached_count += 1;
                        progress(AnalysisEvent::Explained {
                            index,
                            explanation: explanation.clone(),
                            cached: true,
                        });
                        explained[index] = Some((explanation.clone(), true, false));
                    }
                }
                None => misses.push(indices),
            }
        }

        if !misses.is_empty() {
            self.resolve_misses(&errors, &misses, |index, resolved: &Resolved| {
                progress(AnalysisEvent::Explained {
                    index,
                    explanation: resolved.explanation.clone(),
                    cached: false,
                });
                explained[index] = Some((resolved.explanation.clone(), false, resolved.fallback));
            });
        }

        let errors = errors
            .into_iter()
            .zip(explained)
            .map(|(error, slot)| {
                let (explanation, cached, fallback) =
                    slot.unwrap_or_else(|| (fallback_explanation(&error), false, true));
                ErrorWithExplanation {
                    error,
                    explanation,
                    cached,
                    fallback,
                }
            })
            .collect();

        let elapsed = started.elapsed();
        metrics.analysis_duration.observe(elapsed);

        AnalysisResult {
            errors,
            cached_count,
            elapsed,
            outcome: execution.outcome,
            stdout: execution.stdout,
            succeeded: execution.succeeded,
        }
    }

    /// Detector on this thread, sandbox on a scoped one. The sandbox spawns
    /// and reaps its child on the same thread.
    fn detect_and_execute(&self, code: &str, user_id: &str) -> (Vec<Error>, ExecutionResult) {
        let correlation = CorrelationIds::new().with_user(user_id);
        let limits = self.sandbox.limits();

        thread::scope(|s| {
            let correlation_for_worker = correlation.clone();
            let worker = thread::Builder::new()
                .name("explainbox-sandbox".to_string())
                .spawn_scoped(s, move || {
                    self.sandbox.execute_traced(code, limits, correlation_for_worker)
                });

            let detected = detect(code);

            let execution = match worker {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    log::error!("Sandbox worker panicked");
                    crashed_execution("sandbox worker panicked")
                }),
                Err(e) => {
                    log::warn!("Could not start sandbox worker ({}), running inline", e);
                    self.sandbox.execute_traced(code, limits, correlation)
                }
            };
            (detected, execution)
        })
    }

    /// Resolve each missing signature once, concurrently, and hand results
    /// to `deliver` on the calling thread as they complete.
    fn resolve_misses<F>(&self, errors: &[Error], misses: &[Vec<usize>], mut deliver: F)
    where
        F: FnMut(usize, &Resolved),
    {
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Resolved)>();

        thread::scope(|s| {
            for (group, indices) in misses.iter().enumerate() {
                let error = &errors[indices[0]];
                let worker_tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name("explainbox-provider".to_string())
                    .spawn_scoped(s, move || {
                        let _ = worker_tx.send((group, self.resolve(error)));
                    });
                if let Err(e) = spawned {
                    log::warn!("Could not start provider worker ({}), resolving inline", e);
                    let _ = tx.send((group, self.resolve(error)));
                }
            }
            drop(tx);

            for (group, resolved) in rx.iter() {
                for &index in &misses[group] {
                    deliver(index, &resolved);
                }
            }
        });
    }

    fn resolve(&self, error: &Error) -> Resolved {
        let metrics = get_metrics();
        let signature = error.signature.as_str();

        match self.inflight.join(signature) {
            Role::Leader(guard) => {
                // A flight that finished after our lookup may have filled it
                if let Some(explanation) = self.cache.peek(signature) {
                    guard.complete(Some(explanation.clone()));
                    return Resolved {
                        explanation,
                        fallback: false,
                    };
                }

                let outcome = self.retry.run(|attempt| {
                    metrics.provider_calls.inc();
                    log::debug!(
                        "Calling provider '{}' for {} (attempt {})",
                        self.provider.name(),
                        signature,
                        attempt
                    );
                    self.provider.generate(error)
                });

                match outcome.result {
                    Ok(explanation) => {
                        self.cache
                            .put(signature, explanation.clone(), self.cache.default_ttl());
                        guard.complete(Some(explanation.clone()));
                        Resolved {
                            explanation,
                            fallback: false,
                        }
                    }
                    Err(e) => {
                        metrics.provider_failures.inc();
                        log::warn!(
                            "Provider failed for {} after {} attempt(s): {}",
                            signature,
                            outcome.attempts,
                            e
                        );
                        audit::events::provider_failure(signature, &e.to_string(), outcome.attempts);
                        guard.complete(None);
                        Resolved {
                            explanation: fallback_explanation(error),
                            fallback: true,
                        }
                    }
                }
            }
            Role::Follower(flight) => {
                metrics.provider_coalesced.inc();
                match flight.wait().or_else(|| self.cache.peek(signature)) {
                    Some(explanation) => Resolved {
                        explanation,
                        fallback: false,
                    },
                    None => Resolved {
                        explanation: fallback_explanation(error),
                        fallback: true,
                    },
                }
            }
        }
    }
}

fn crashed_execution(reason: &str) -> ExecutionResult {
    ExecutionResult {
        succeeded: false,
        errors: vec![synthetic(CRASHED_ERROR, reason.to_string())],
        outcome: OutcomeClass::Crashed,
        ..ExecutionResult::default()
    }
}

/// Merge detector and sandbox errors.
///
/// Syntax and warning errors come first, then runtime errors, each group
/// ordered by position. An interpreter error on the same `(line, kind)` as a
/// detector error is dropped in favour of the detector's.
pub fn merge_errors(detected: Vec<Error>, executed: Vec<Error>) -> Vec<Error> {
    let mut seen: HashSet<(u32, ErrorKind)> = detected
        .iter()
        .map(|e| (e.position.line, e.kind))
        .collect();

    let mut merged = detected;
    for error in executed {
        if seen.insert((error.position.line, error.kind)) {
            merged.push(error);
        }
    }

    merged.sort_by_key(|e| (e.kind.merge_rank(), e.position.line, e.position.column));
    merged
}

/// Indices of errors sharing a signature, in first-seen order
fn group_by_signature(errors: &[Error]) -> Vec<Vec<usize>> {
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, error) in errors.iter().enumerate() {
        match slots.get(error.signature.as_str()) {
            Some(&group) => groups[group].push(index),
            None => {
                slots.insert(error.signature.as_str(), groups.len());
                groups.push(vec![index]);
            }
        }
    }
    groups
}
