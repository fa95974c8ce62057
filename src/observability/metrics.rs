// Pipeline metrics
//
// Lock-free counters, gauges and latency histograms for:
// - Sandbox outcomes (OK, RE, TLE, MLE, SV, CRASH, IE)
// - Cache hit/miss traffic and evictions
// - Provider calls, retries and failures
// - History records and store failures

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{OutcomeClass, Result};
use crate::storage::write_atomic;
use std::path::Path;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Create histogram with standard latency buckets (in seconds)
    pub fn new_latency() -> Self {
        let bucket_bounds = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ];

        let buckets = bucket_bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn mean_millis(&self) -> f64 {
        let count = self.get_count();
        if count == 0 {
            0.0
        } else {
            self.get_sum_micros() as f64 / count as f64 / 1000.0
        }
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub analyses_total: Counter,
    pub active_analyses: Gauge,

    // Sandbox outcome counters
    pub executions_total: Counter,
    pub executions_ok: Counter,
    pub executions_re: Counter,
    pub executions_tle: Counter,
    pub executions_mle: Counter,
    pub executions_sv: Counter,
    pub executions_crash: Counter,
    pub executions_ie: Counter,

    // Cache traffic
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_evictions: Counter,
    pub cache_expired_swept: Counter,

    // Provider traffic
    pub provider_calls: Counter,
    pub provider_retries: Counter,
    pub provider_failures: Counter,
    pub provider_coalesced: Counter,

    // History and storage
    pub history_records: Counter,
    pub history_retained_removed: Counter,
    pub store_failures: Counter,

    pub cleanup_failures: Counter,

    // Latency histograms
    pub analysis_duration: Histogram,
    pub sandbox_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            analyses_total: Counter::new(),
            active_analyses: Gauge::new(),

            executions_total: Counter::new(),
            executions_ok: Counter::new(),
            executions_re: Counter::new(),
            executions_tle: Counter::new(),
            executions_mle: Counter::new(),
            executions_sv: Counter::new(),
            executions_crash: Counter::new(),
            executions_ie: Counter::new(),

            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_evictions: Counter::new(),
            cache_expired_swept: Counter::new(),

            provider_calls: Counter::new(),
            provider_retries: Counter::new(),
            provider_failures: Counter::new(),
            provider_coalesced: Counter::new(),

            history_records: Counter::new(),
            history_retained_removed: Counter::new(),
            store_failures: Counter::new(),

            cleanup_failures: Counter::new(),

            analysis_duration: Histogram::new_latency(),
            sandbox_duration: Histogram::new_latency(),
        }
    }

    /// Record sandbox outcome
    pub fn record_execution(&self, outcome: OutcomeClass, wall_time: Duration) {
        self.executions_total.inc();
        self.sandbox_duration.observe(wall_time);

        match outcome {
            OutcomeClass::Ok => self.executions_ok.inc(),
            OutcomeClass::RuntimeError => self.executions_re.inc(),
            OutcomeClass::Timeout => self.executions_tle.inc(),
            OutcomeClass::MemoryLimit => self.executions_mle.inc(),
            OutcomeClass::Security => self.executions_sv.inc(),
            OutcomeClass::Crashed => self.executions_crash.inc(),
            OutcomeClass::BoundaryFailure => self.executions_ie.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            analyses_total: self.analyses_total.get(),
            active_analyses: self.active_analyses.get(),
            executions_total: self.executions_total.get(),
            executions_by_outcome: OutcomeCounts {
                ok: self.executions_ok.get(),
                runtime_error: self.executions_re.get(),
                timeout: self.executions_tle.get(),
                memory_limit: self.executions_mle.get(),
                security: self.executions_sv.get(),
                crashed: self.executions_crash.get(),
                boundary_failure: self.executions_ie.get(),
            },
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_evictions: self.cache_evictions.get(),
            cache_expired_swept: self.cache_expired_swept.get(),
            provider_calls: self.provider_calls.get(),
            provider_retries: self.provider_retries.get(),
            provider_failures: self.provider_failures.get(),
            provider_coalesced: self.provider_coalesced.get(),
            history_records: self.history_records.get(),
            history_retained_removed: self.history_retained_removed.get(),
            store_failures: self.store_failures.get(),
            cleanup_failures: self.cleanup_failures.get(),
            analysis_mean_ms: self.analysis_duration.mean_millis(),
            sandbox_mean_ms: self.sandbox_duration.mean_millis(),
        }
    }

    /// Write the Prometheus export atomically, for a textfile collector
    pub fn write_prometheus(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.export_prometheus().as_bytes())
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP explainbox_analyses_total Total number of analyze calls\n");
        output.push_str("# TYPE explainbox_analyses_total counter\n");
        output.push_str(&format!(
            "explainbox_analyses_total {}\n",
            self.analyses_total.get()
        ));

        output.push_str("# HELP explainbox_executions_by_outcome Sandbox runs by outcome\n");
        output.push_str("# TYPE explainbox_executions_by_outcome counter\n");
        for (label, counter) in [
            ("OK", &self.executions_ok),
            ("RE", &self.executions_re),
            ("TLE", &self.executions_tle),
            ("MLE", &self.executions_mle),
            ("SV", &self.executions_sv),
            ("CRASH", &self.executions_crash),
            ("IE", &self.executions_ie),
        ] {
            output.push_str(&format!(
                "explainbox_executions_by_outcome{{outcome=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP explainbox_cache_requests_total Cache lookups\n");
        output.push_str("# TYPE explainbox_cache_requests_total counter\n");
        output.push_str(&format!(
            "explainbox_cache_requests_total{{result=\"hit\"}} {}\n",
            self.cache_hits.get()
        ));
        output.push_str(&format!(
            "explainbox_cache_requests_total{{result=\"miss\"}} {}\n",
            self.cache_misses.get()
        ));

        output.push_str("# HELP explainbox_provider_calls_total Explanation provider calls\n");
        output.push_str("# TYPE explainbox_provider_calls_total counter\n");
        output.push_str(&format!(
            "explainbox_provider_calls_total {}\n",
            self.provider_calls.get()
        ));
        output.push_str(&format!(
            "explainbox_provider_failures_total {}\n",
            self.provider_failures.get()
        ));

        output.push_str("# HELP explainbox_analysis_duration_seconds analyze latency\n");
        output.push_str("# TYPE explainbox_analysis_duration_seconds histogram\n");
        for bucket in &self.analysis_duration.buckets {
            output.push_str(&format!(
                "explainbox_analysis_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "explainbox_analysis_duration_seconds_sum {}\n",
            self.analysis_duration.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "explainbox_analysis_duration_seconds_count {}\n",
            self.analysis_duration.get_count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub ok: u64,
    pub runtime_error: u64,
    pub timeout: u64,
    pub memory_limit: u64,
    pub security: u64,
    pub crashed: u64,
    pub boundary_failure: u64,
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub analyses_total: u64,
    pub active_analyses: u64,
    pub executions_total: u64,
    pub executions_by_outcome: OutcomeCounts,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_expired_swept: u64,
    pub provider_calls: u64,
    pub provider_retries: u64,
    pub provider_failures: u64,
    pub provider_coalesced: u64,
    pub history_records: u64,
    pub history_retained_removed: u64,
    pub store_failures: u64,
    pub cleanup_failures: u64,
    pub analysis_mean_ms: f64,
    pub sandbox_mean_ms: f64,
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
