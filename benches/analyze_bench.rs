// Latency benchmark for the in-process parts of analysis
// Detector fast path, signature derivation, and a cache-warm analyze over an
// in-memory boundary. Real interpreter runs are left to the integration tests.

use explainbox::core::boundary::{BoundaryOutcome, ExitKind};
use explainbox::detect::detect;
use explainbox::{
    Analyzer, ExecutionLimits, ExplanationCache, HistoryStore, IsolatedExecutionBoundary,
    RetryPolicy, RuleBasedProvider, Sandbox,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 2_000;
const WARMUP_ITERATIONS: usize = 100;

const SNIPPET: &str = r#"
def mean(values)
    total = 0
    for v in values:
        total += v
    return total / len(values

print(mean([1, 2, 3]))
"#;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let sum: Duration = samples.iter().sum();

        Self {
            p50: samples[len / 2],
            p95: samples[len * 95 / 100],
            p99: samples[len * 99 / 100],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }
}

struct BenchmarkResult {
    scenario: &'static str,
    stats: LatencyStats,
    budget: Duration,
}

impl BenchmarkResult {
    fn passed(&self) -> bool {
        self.stats.p95 < self.budget
    }

    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        println!("  p50: {:?}", self.stats.p50);
        println!("  p95: {:?}", self.stats.p95);
        println!("  p99: {:?}", self.stats.p99);
        println!("  max: {:?}", self.stats.max);
        println!("  mean: {:?}", self.stats.mean);
        if self.passed() {
            println!("✅ PASS (p95 < {:?})", self.budget);
        } else {
            println!("❌ FAIL: p95={:?} (target <{:?})", self.stats.p95, self.budget);
        }
    }
}

/// Boundary that reports a clean exit without running anything
struct NullBoundary;

impl IsolatedExecutionBoundary for NullBoundary {
    type Handle = ();

    fn spawn(&self, _code: &str, _limits: &ExecutionLimits) -> explainbox::Result<()> {
        Ok(())
    }

    fn wait_or_kill(&self, _handle: (), _timeout: Duration) -> explainbox::Result<BoundaryOutcome> {
        Ok(BoundaryOutcome {
            exit: ExitKind::Exited(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
            wall_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
            memory_peak: 0,
            kill_report: None,
        })
    }
}

fn measure<F: FnMut()>(mut op: F) -> LatencyStats {
    for _ in 0..WARMUP_ITERATIONS {
        op();
    }
    let samples = (0..ITERATIONS)
        .map(|_| {
            let start = Instant::now();
            op();
            start.elapsed()
        })
        .collect();
    LatencyStats::from_samples(samples)
}

fn benchmark_detector() -> BenchmarkResult {
    BenchmarkResult {
        scenario: "Detector fast path",
        stats: measure(|| {
            std::hint::black_box(detect(std::hint::black_box(SNIPPET)));
        }),
        budget: Duration::from_millis(1),
    }
}

fn benchmark_warm_analyze() -> BenchmarkResult {
    let analyzer = Analyzer::new(
        Sandbox::new(NullBoundary, ExecutionLimits::default()),
        Arc::new(ExplanationCache::new(1_000, Duration::from_secs(3600))),
        Arc::new(HistoryStore::new(5)),
        Arc::new(RuleBasedProvider::new()),
        RetryPolicy::immediate(1),
    );
    analyzer.analyze(SNIPPET, "bench");

    BenchmarkResult {
        scenario: "Cache-warm analyze",
        stats: measure(|| {
            std::hint::black_box(analyzer.analyze(SNIPPET, "bench"));
        }),
        budget: Duration::from_millis(5),
    }
}

fn main() {
    println!("=== explainbox analysis benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let results = vec![benchmark_detector(), benchmark_warm_analyze()];
    for result in &results {
        result.print();
    }

    let passed = results.iter().filter(|r| r.passed()).count();
    println!("\n=== Summary ===");
    println!("{}/{} scenarios within budget", passed, results.len());
    if passed != results.len() {
        std::process::exit(1);
    }
}
