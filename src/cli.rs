use crate::cache::ExplanationCache;
use crate::config::config::ExplainboxConfig;
use crate::config::types::ErrorKind;
use crate::config::validator::validate_config;
use crate::exec::preexec::probe_controls;
use crate::history::{HistoryQuery, HistoryStore};
use crate::observability::metrics::get_metrics;
use crate::orchestrator::maintenance::{report_store_failure, run_maintenance};
use crate::orchestrator::{
    build_analyzer, open_stores, AnalysisEvent, AnalysisResult, RuleBasedProvider,
};
use crate::safety::workspace::WorkspaceManager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Scratch directories older than this are leftovers of crashed runs
const STALE_WORKSPACE_AGE: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ./explainbox.json, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Audit log file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    /// Write Prometheus metrics to this file before exiting
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a source file and explain its errors
    Analyze {
        /// Source file to analyze
        #[arg(long)]
        file: PathBuf,
        /// User the errors are recorded for
        #[arg(long)]
        user: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a user's recorded errors, newest first
    History {
        #[arg(long)]
        user: String,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Only errors seen at least this many times
        #[arg(long)]
        min_count: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize a user's error history
    Stats {
        #[arg(long)]
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Drop expired explanations, stale history and leftover scratch directories
    Sweep,
    /// Check the interpreter and the isolation controls this host provides
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Syntax,
    Runtime,
    Warning,
}

impl From<KindArg> for ErrorKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Syntax => ErrorKind::Syntax,
            KindArg::Runtime => ErrorKind::Runtime,
            KindArg::Warning => ErrorKind::Warning,
        }
    }
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    crate::observability::audit::init_security_logger(cli.audit_log.clone())
        .context("Failed to initialize audit logger")?;

    let config = load_config(cli.config.as_deref())?;
    validate_config(&config).context("Invalid configuration")?;

    let outcome = match cli.command {
        Commands::Analyze { file, user, json } => analyze(&config, &file, &user, json),
        Commands::History {
            user,
            kind,
            min_count,
            limit,
            json,
        } => {
            let mut query = HistoryQuery::new();
            if let Some(kind) = kind {
                query = query.kind(kind.into());
            }
            if let Some(min_count) = min_count {
                query = query.min_count(min_count);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            history(&config, &user, &query, json)
        }
        Commands::Stats { user, json } => stats(&config, &user, json),
        Commands::Sweep => sweep(&config),
        Commands::CheckDeps { verbose } => check_dependencies(&config, verbose),
    };

    if let Some(path) = &cli.metrics_out {
        if let Err(e) = get_metrics().write_prometheus(path) {
            log::warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }
    outcome
}

fn load_config(path: Option<&Path>) -> Result<ExplainboxConfig> {
    let config = match path {
        Some(path) => ExplainboxConfig::load_from_file(path)?,
        None => ExplainboxConfig::load_default()?,
    };
    Ok(config)
}

fn flush_stores(cache: &ExplanationCache, history: &HistoryStore) {
    if let Err(e) = cache.flush() {
        report_store_failure("cache", &e);
    }
    if let Err(e) = history.flush() {
        report_store_failure("history", &e);
    }
}

fn analyze(config: &ExplainboxConfig, file: &Path, user: &str, json: bool) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let (cache, history) = open_stores(config);
    let analyzer = build_analyzer(
        config,
        Arc::clone(&cache),
        Arc::clone(&history),
        Arc::new(RuleBasedProvider::new()),
    )?;

    let result = if json {
        analyzer.analyze(&code, user)
    } else {
        analyzer.analyze_with_progress(&code, user, &print_progress)
    };
    flush_stores(&cache, &history);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(())
}

fn print_progress(event: AnalysisEvent) {
    match event {
        AnalysisEvent::ErrorsDetected(errors) if errors.is_empty() => {
            println!("No errors found");
        }
        AnalysisEvent::ErrorsDetected(errors) => {
            println!("Found {} error(s):", errors.len());
            for (index, error) in errors.iter().enumerate() {
                println!(
                    "  [{}] line {}:{} {} {}: {}",
                    index,
                    error.position.line,
                    error.position.column,
                    error.kind,
                    error.name,
                    error.raw_message
                );
            }
            println!();
        }
        AnalysisEvent::Explained {
            index,
            explanation,
            cached,
        } => {
            println!(
                "[{}] {}{}",
                index,
                explanation.explanation_text,
                if cached { " (cached)" } else { "" }
            );
            println!("    Fix: {}", explanation.suggested_fix);
        }
    }
}

fn print_summary(result: &AnalysisResult) {
    println!();
    if !result.stdout.is_empty() {
        println!("--- program output ---");
        print!("{}", result.stdout);
        if !result.stdout.ends_with('\n') {
            println!();
        }
        println!("----------------------");
    }
    println!(
        "Outcome: {} | errors: {} | cached: {} | elapsed: {} ms",
        result.outcome.as_str(),
        result.errors.len(),
        result.cached_count,
        result.elapsed.as_millis()
    );
}

fn history(config: &ExplainboxConfig, user: &str, query: &HistoryQuery, json: bool) -> Result<()> {
    let (_, history) = open_stores(config);
    let entries = history.query(user, query);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No history for {}", user);
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:>4}x  {:<8} {:<20} last seen {}  `{}`",
            entry.signature,
            entry.occurrence_count,
            entry.kind,
            entry.error_name,
            entry.last_seen.format("%Y-%m-%d %H:%M"),
            entry.sample_snippet
        );
    }
    Ok(())
}

fn stats(config: &ExplainboxConfig, user: &str, json: bool) -> Result<()> {
    let (cache, history) = open_stores(config);
    let statistics = history.statistics(user);

    if json {
        let report = serde_json::json!({
            "history": statistics,
            "cache": cache.stats(),
            "metrics": get_metrics().snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("User: {}", statistics.user_id);
    println!("  Total occurrences: {}", statistics.total);
    println!("  Distinct errors:   {}", statistics.unique_kinds);
    println!("  Distinct mistakes: {}", statistics.unique_signatures);
    if !statistics.top_k_by_count.is_empty() {
        println!("  Most frequent:");
        for entry in &statistics.top_k_by_count {
            println!(
                "    {:>4}x {} ({})",
                entry.occurrence_count, entry.error_name, entry.signature
            );
        }
    }
    println!("Cached explanations: {}", cache.len());
    Ok(())
}

fn sweep(config: &ExplainboxConfig) -> Result<()> {
    let (cache, history) = open_stores(config);
    let retention = Duration::from_secs(config.history.retention_days.saturating_mul(24 * 3600));
    let report = run_maintenance(&cache, &history, retention);

    let workspaces = WorkspaceManager::new(config.sandbox.scratch_root.clone())?;
    let stale = workspaces.cleanup_old_workspaces(STALE_WORKSPACE_AGE)?;

    println!("Expired explanations removed: {}", report.expired);
    println!("Stale history entries removed: {}", report.retained);
    println!("Leftover scratch directories removed: {}", stale);
    if report.flush_failures > 0 {
        println!("Store flush failures: {} (see audit log)", report.flush_failures);
    }
    Ok(())
}

fn check_dependencies(config: &ExplainboxConfig, verbose: bool) -> Result<()> {
    use std::process::Command;

    println!("🔍 Checking explainbox dependencies...");
    println!();

    let mut all_ok = true;
    let interpreter = &config.sandbox.interpreter;

    match Command::new(interpreter).arg("--version").output() {
        Ok(output) if output.status.success() => {
            println!("✅ Interpreter {} - OK", interpreter.display());
            if verbose {
                let version = if output.stdout.is_empty() {
                    String::from_utf8_lossy(&output.stderr).into_owned()
                } else {
                    String::from_utf8_lossy(&output.stdout).into_owned()
                };
                println!("  {}", version.lines().next().unwrap_or("").trim());
            }
        }
        Ok(_) => {
            println!("❌ Interpreter {} - FAILED", interpreter.display());
            all_ok = false;
        }
        Err(e) => {
            println!("❌ Interpreter {} - NOT FOUND", interpreter.display());
            if verbose {
                println!("  {}", e);
            }
            all_ok = false;
        }
    }

    // Never strict here: the point is to report what is missing
    let controls = probe_controls(false)?;
    for (name, available) in [
        ("User/network namespace", controls.user_net_namespace),
        ("Landlock filesystem rules", controls.landlock),
    ] {
        if available {
            println!("✅ {} - OK", name);
        } else {
            println!("⚠️  {} - UNAVAILABLE", name);
            if config.sandbox.strict_mode {
                all_ok = false;
            }
        }
    }

    println!();
    if all_ok {
        println!("🎉 explainbox is ready to use");
        if verbose {
            println!();
            println!("💡 Usage example:");
            println!("  explainbox analyze --file snippet.py --user alice");
        }
        Ok(())
    } else {
        anyhow::bail!("missing dependencies")
    }
}
