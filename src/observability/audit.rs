/// Security and failure audit trail for explainbox
/// Structured JSON lines appended to an audit file, mirrored to the `log` facade
use crate::config::types::{ExplainError, OutcomeClass, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Lifecycle events
    ExecutionStart,
    ExecutionEnd,

    // Restricted resource access from the snippet
    SecurityViolation,

    // Limit violation events
    WallTimeLimitViolation,
    CpuLimitViolation,
    MemoryLimitViolation,

    // Termination and control events
    ForcedKill,
    ControlDegraded,

    // Local recovery events
    CleanupFailure,
    ProviderFailure,
    StoreFailure,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ExecutionStart => SecuritySeverity::Low,
            SecurityEventType::ExecutionEnd => SecuritySeverity::Low,

            SecurityEventType::SecurityViolation => SecuritySeverity::Critical,

            SecurityEventType::WallTimeLimitViolation => SecuritySeverity::Medium,
            SecurityEventType::CpuLimitViolation => SecuritySeverity::Medium,
            SecurityEventType::MemoryLimitViolation => SecuritySeverity::Medium,

            SecurityEventType::ForcedKill => SecuritySeverity::High,
            SecurityEventType::ControlDegraded => SecuritySeverity::High,

            SecurityEventType::CleanupFailure => SecuritySeverity::Critical,
            SecurityEventType::ProviderFailure => SecuritySeverity::Medium,
            SecurityEventType::StoreFailure => SecuritySeverity::High,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// One `analyze` call
    pub request_id: String,
    /// One sandbox run inside the request
    pub run_id: String,
    pub user_id: Option<String>,
    /// Root PID of the boundary in the host namespace
    pub root_pid: Option<u32>,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            user_id: None,
            root_pid: None,
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// Set root PID after process spawn
    pub fn with_root_pid(mut self, pid: u32) -> Self {
        self.root_pid = Some(pid);
        self
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub outcome: Option<OutcomeClass>,
    pub signature: Option<String>,
    pub file_path: Option<String>,
}

impl SecurityEvent {
    /// Create a new event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        let severity = event_type.default_severity();
        Self {
            event_type,
            severity,
            timestamp: SystemTime::now(),
            details,
            correlation: None,
            outcome: None,
            signature: None,
            file_path: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_outcome(mut self, outcome: OutcomeClass) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn with_file_path(mut self, file_path: String) -> Self {
        self.file_path = Some(file_path);
        self
    }

    fn to_json_line(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });

        if let Some(correlation) = &self.correlation {
            entry["correlation"] =
                serde_json::to_value(correlation).unwrap_or(serde_json::Value::Null);
        }
        if let Some(outcome) = &self.outcome {
            entry["outcome"] = serde_json::json!(outcome);
        }
        if let Some(signature) = &self.signature {
            entry["signature"] = serde_json::json!(signature);
        }
        if let Some(file_path) = &self.file_path {
            entry["file_path"] = serde_json::json!(file_path);
        }
        entry
    }
}

fn log_to_facade(event: &SecurityEvent) {
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!("AUDIT {:?}: {:?} - {}", event.severity, event.event_type, event.details);
        }
        SecuritySeverity::Medium => {
            warn!("AUDIT {:?}: {:?} - {}", event.severity, event.event_type, event.details);
        }
        SecuritySeverity::Low => {
            info!("AUDIT {:?}: {:?} - {}", event.severity, event.event_type, event.details);
        }
    }
}

/// Audit logger that writes structured lines and mirrors them to `log`
pub struct SecurityLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("explainbox")
                .join("audit.log")
        });

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ExplainError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| ExplainError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path,
        })
    }

    pub fn log_security_event(&self, event: SecurityEvent) {
        log_to_facade(&event);
        let line = event.to_json_line();

        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", line) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

/// Global audit logger instance
static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global audit logger.
///
/// Without an explicit path, user-writable fallbacks are tried and the logger
/// degrades to `log`-only output when none can be opened.
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    let err = match SecurityLogger::new(audit_path.clone()) {
        Ok(logger) => {
            install(logger, None);
            return Ok(());
        }
        Err(e) => e,
    };

    if audit_path.is_some() {
        error!("Failed to initialize audit logger: {}", err);
        return Err(err);
    }

    let fallback_paths = vec![
        std::env::temp_dir().join(format!("explainbox-audit-{}.log", unsafe {
            libc::geteuid()
        })),
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(".explainbox")
            .join("audit.log"),
    ];

    for fallback in fallback_paths {
        match SecurityLogger::new(Some(fallback.clone())) {
            Ok(logger) => {
                install(logger, Some(&fallback));
                return Ok(());
            }
            Err(fallback_err) => {
                warn!(
                    "Failed to initialize fallback audit logger at {}: {}",
                    fallback.display(),
                    fallback_err
                );
            }
        }
    }

    warn!(
        "Audit logger unavailable (all paths failed). Continuing with log-only audit events: {}",
        err
    );
    Ok(())
}

fn install(logger: SecurityLogger, fallback: Option<&PathBuf>) {
    if SECURITY_LOGGER.set(logger).is_err() {
        error!("Audit logger already initialized");
    } else if let Some(path) = fallback {
        warn!("Audit logger initialized using fallback path: {}", path.display());
    } else {
        info!("Audit logger initialized");
    }
}

/// Log an event using the global logger, or `log` alone when uninitialized
pub fn log_security_event(event: SecurityEvent) {
    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.log_security_event(event);
    } else {
        log_to_facade(&event);
    }
}

/// Convenience functions for common events
pub mod events {
    use super::*;

    pub fn execution_start(correlation: CorrelationIds, interpreter: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionStart,
            format!(
                "Execution started: run_id={} interpreter={}",
                correlation.run_id, interpreter
            ),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn execution_end(correlation: CorrelationIds, outcome: OutcomeClass, wall_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionEnd,
            format!(
                "Execution ended: run_id={} outcome={} wall={}ms",
                correlation.run_id,
                outcome.as_str(),
                wall_ms
            ),
        )
        .with_correlation(correlation)
        .with_outcome(outcome);
        log_security_event(event);
    }

    pub fn security_violation(correlation: CorrelationIds, action: &str, target: Option<&str>) {
        let mut event = SecurityEvent::new(
            SecurityEventType::SecurityViolation,
            format!("Blocked restricted action: {}", action),
        )
        .with_correlation(correlation)
        .with_outcome(OutcomeClass::Security);
        if let Some(target) = target {
            event = event.with_file_path(target.to_string());
        }
        log_security_event(event);
    }

    pub fn wall_time_limit_violation(correlation: CorrelationIds, used_ms: u64, limit_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::WallTimeLimitViolation,
            format!(
                "Wall time limit violated: used={} ms, limit={} ms",
                used_ms, limit_ms
            ),
        )
        .with_correlation(correlation)
        .with_outcome(OutcomeClass::Timeout);
        log_security_event(event);
    }

    pub fn cpu_limit_violation(correlation: CorrelationIds, used_ms: u64, limit_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::CpuLimitViolation,
            format!("CPU limit violated: used={} ms, limit={} ms", used_ms, limit_ms),
        )
        .with_correlation(correlation)
        .with_outcome(OutcomeClass::Timeout);
        log_security_event(event);
    }

    pub fn memory_limit_violation(correlation: CorrelationIds, peak: u64, limit: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::MemoryLimitViolation,
            format!(
                "Memory limit violated: peak={} bytes, limit={} bytes",
                peak, limit
            ),
        )
        .with_correlation(correlation)
        .with_outcome(OutcomeClass::MemoryLimit);
        log_security_event(event);
    }

    pub fn forced_kill(correlation: CorrelationIds, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ForcedKill,
            format!("Forced kill: {}", reason),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn control_degraded(control: &str, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ControlDegraded,
            format!("Control degraded: {} - {}", control, reason),
        );
        log_security_event(event);
    }

    pub fn cleanup_failure(correlation: CorrelationIds, error: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::CleanupFailure,
            format!("Cleanup failed: {}", error),
        )
        .with_correlation(correlation);
        log_security_event(event);
    }

    pub fn provider_failure(signature: &str, error: &str, attempts: u32) {
        let event = SecurityEvent::new(
            SecurityEventType::ProviderFailure,
            format!(
                "Explanation provider failed after {} attempt(s): {}",
                attempts, error
            ),
        )
        .with_signature(signature);
        log_security_event(event);
    }

    pub fn store_failure(store: &str, error: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::StoreFailure,
            format!("{} store failure: {}", store, error),
        );
        log_security_event(event);
    }
}
