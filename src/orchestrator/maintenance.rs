/// Background maintenance: cache expiry sweep, history retention and flush
use crate::cache::ExplanationCache;
use crate::config::types::{ExplainError, Result};
use crate::history::HistoryStore;
use crate::observability::audit;
use crate::observability::metrics::get_metrics;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcome of one maintenance pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub retained: usize,
    pub flush_failures: usize,
}

/// Sweep expired explanations, drop stale history rows and persist both
/// stores. Store failures are logged and audited, never returned.
pub fn run_maintenance(
    cache: &ExplanationCache,
    history: &HistoryStore,
    retention: Duration,
) -> MaintenanceReport {
    let expired = cache.sweep_expired();
    let retained = history.retain(retention);

    let flush_failures = [("cache", cache.flush()), ("history", history.flush())]
        .into_iter()
        .filter(|(store, result)| match result {
            Ok(()) => false,
            Err(e) => {
                report_store_failure(store, e);
                true
            }
        })
        .count();

    MaintenanceReport {
        expired,
        retained,
        flush_failures,
    }
}

pub fn report_store_failure(store: &str, error: &ExplainError) {
    log::warn!("Failed to persist {} store: {}", store, error);
    get_metrics().store_failures.inc();
    audit::events::store_failure(store, &error.to_string());
}

/// Periodic maintenance thread
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

impl Sweeper {
    pub fn start(
        cache: Arc<ExplanationCache>,
        history: Arc<HistoryStore>,
        interval: Duration,
        retention: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("explainbox-sweeper".to_string())
            .spawn(move || {
                log::info!("Started maintenance thread (every {:?})", interval);
                loop {
                    // A message or a dropped sender both mean stop
                    match shutdown_rx.recv_timeout(interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }

                    let report = run_maintenance(&cache, &history, retention);
                    log::debug!(
                        "Maintenance: {} expired, {} retained away, {} flush failures",
                        report.expired,
                        report.retained,
                        report.flush_failures
                    );
                }
                log::info!("Maintenance thread shutting down");
            })?;

        Ok(Self {
            handle: Some(handle),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Error, ErrorKind, Explanation, Position};
    use chrono::Utc;
    use std::time::Instant;

    fn explanation() -> Explanation {
        Explanation {
            error_name: "NameError".to_string(),
            explanation_text: "text".to_string(),
            suggested_fix: "fix".to_string(),
        }
    }

    #[test]
    fn test_run_maintenance_sweeps_and_retains() {
        let cache = ExplanationCache::new(10, Duration::from_secs(60));
        cache.put("expired", explanation(), Duration::ZERO);
        cache.put("fresh", explanation(), Duration::from_secs(60));

        let history = HistoryStore::new(5);
        let error = Error::new(ErrorKind::Runtime, "NameError", "name 'x' is not defined", Position::new(1, 1, 1), "x");
        history.record_at("u1", &error, Utc::now() - chrono::Duration::days(10));

        let report = run_maintenance(&cache, &history, Duration::from_secs(24 * 3600));
        assert_eq!(
            report,
            MaintenanceReport {
                expired: 1,
                retained: 1,
                flush_failures: 0,
            }
        );
        assert_eq!(cache.len(), 1);
        assert!(history.is_empty());
    }

    #[test]
    fn test_sweeper_runs_and_stops() {
        let cache = Arc::new(ExplanationCache::new(10, Duration::from_secs(60)));
        let history = Arc::new(HistoryStore::new(5));
        cache.put("expired", explanation(), Duration::ZERO);

        let mut sweeper = Sweeper::start(
            Arc::clone(&cache),
            Arc::clone(&history),
            Duration::from_millis(10),
            Duration::from_secs(3600),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !cache.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        sweeper.stop();
        sweeper.stop();
        assert!(cache.is_empty());
    }
}
