/// Outcome classification for boundary runs
/// Maps a raw `BoundaryOutcome` plus guard reports to an `OutcomeClass` and
/// the learner-facing errors. Pure over its inputs.
use crate::config::types::{Error, ErrorKind, ExecutionLimits, OutcomeClass, Position};
use crate::core::boundary::{BoundaryOutcome, ExitKind};
use crate::core::runner::{parse_guard_reports, GuardReport, MEMORY_EXIT_CODE, SECURITY_EXIT_CODE};
use serde::{Deserialize, Serialize};

/// Synthetic error names for run-level failures
pub const TIMEOUT_ERROR: &str = "Timeout";
pub const MEMORY_LIMIT_ERROR: &str = "MemoryLimit";
pub const CRASHED_ERROR: &str = "Crashed";
pub const SECURITY_ERROR: &str = "Security";
pub const SANDBOX_UNAVAILABLE_ERROR: &str = "SandboxUnavailable";
/// Name used for a non-zero exit the guard did not explain
pub const SYSTEM_EXIT_ERROR: &str = "SystemExit";

/// Which piece of evidence decided the outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictCause {
    NormalExit,
    CompileError,
    UncaughtException,
    NonzeroExit,
    WallDeadline,
    CpuLimitSignal,
    CpuLimitKill,
    MemoryReport,
    UnattributedKill,
    SecurityReport,
    KernelDenial,
    Signal,
    GuardFailure,
    StartFailure,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub outcome: OutcomeClass,
    pub cause: VerdictCause,
    pub errors: Vec<Error>,
    /// Security report details, for the audit log
    pub violation: Option<(String, Option<String>)>,
}

impl Classification {
    fn new(outcome: OutcomeClass, cause: VerdictCause, errors: Vec<Error>) -> Self {
        Self {
            outcome,
            cause,
            errors,
            violation: None,
        }
    }

    /// The boundary could not be started at all
    pub fn start_failure(reason: &str) -> Self {
        Self::new(
            OutcomeClass::BoundaryFailure,
            VerdictCause::StartFailure,
            vec![synthetic(
                SANDBOX_UNAVAILABLE_ERROR,
                format!("the sandbox could not run this code: {}", reason),
            )],
        )
    }

    /// The boundary started but its result could not be collected
    pub fn collection_failure(reason: &str) -> Self {
        Self::new(
            OutcomeClass::Crashed,
            VerdictCause::GuardFailure,
            vec![synthetic(
                CRASHED_ERROR,
                format!("the result of this run could not be collected: {}", reason),
            )],
        )
    }
}

/// Verdict classifier - pure function over the boundary outcome
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify one run.
    ///
    /// Precedence: supervisor kill, security, memory, CPU signals, other
    /// signals, then the exit status with the guard's exception report.
    pub fn classify(outcome: &BoundaryOutcome, limits: &ExecutionLimits, code: &str) -> Classification {
        let (reports, rest) = parse_guard_reports(&outcome.stderr_lossy());

        if outcome.exit == ExitKind::TimedOut {
            return Self::wall_deadline(limits);
        }

        let security = reports.iter().rev().find_map(|r| match r {
            GuardReport::Security { action, target } => Some((action.clone(), target.clone())),
            _ => None,
        });
        if security.is_some() || outcome.exit == ExitKind::Exited(SECURITY_EXIT_CODE) {
            return Self::security(VerdictCause::SecurityReport, security);
        }

        let memory_report = reports.iter().any(|r| matches!(r, GuardReport::Memory));
        if memory_report || outcome.exit == ExitKind::Exited(MEMORY_EXIT_CODE) {
            return Self::memory(VerdictCause::MemoryReport, limits);
        }

        match outcome.exit {
            ExitKind::Signaled(libc::SIGXCPU) => Self::timeout(
                VerdictCause::CpuLimitSignal,
                format!("CPU time limit of {} ms exceeded", limits.cpu_cap.as_millis()),
            ),
            ExitKind::Signaled(libc::SIGKILL) if outcome.cpu_time >= limits.cpu_cap => Self::timeout(
                VerdictCause::CpuLimitKill,
                format!("CPU time limit of {} ms exceeded", limits.cpu_cap.as_millis()),
            ),
            ExitKind::Signaled(libc::SIGKILL) => Self::memory(VerdictCause::UnattributedKill, limits),
            ExitKind::Signaled(sig) => Classification::new(
                OutcomeClass::Crashed,
                VerdictCause::Signal,
                vec![synthetic(
                    CRASHED_ERROR,
                    format!("the program was terminated by signal {}", sig),
                )],
            ),
            ExitKind::Exited(0) => Classification::new(OutcomeClass::Ok, VerdictCause::NormalExit, Vec::new()),
            ExitKind::Exited(status) => Self::nonzero_exit(status, &reports, &rest, code),
            ExitKind::TimedOut => Self::wall_deadline(limits),
        }
    }

    fn nonzero_exit(status: i32, reports: &[GuardReport], rest: &str, code: &str) -> Classification {
        let reported = reports.iter().rev().find_map(|r| match r {
            GuardReport::Syntax {
                name,
                message,
                line,
                column,
                end_column,
            } => Some((ErrorKind::Syntax, VerdictCause::CompileError, name, message, *line, *column, *end_column)),
            GuardReport::Exception {
                name,
                message,
                line,
                column,
                end_column,
            } => Some((ErrorKind::Runtime, VerdictCause::UncaughtException, name, message, *line, *column, *end_column)),
            _ => None,
        });

        if let Some((kind, cause, name, message, line, column, end_column)) = reported {
            if let Some(violation) = kernel_denial(name, message) {
                return Self::security(VerdictCause::KernelDenial, Some(violation));
            }
            let snippet = source_line(code, line);
            let position = span_position(line, column, end_column, &snippet);
            return Classification::new(
                OutcomeClass::RuntimeError,
                cause,
                vec![Error::new(kind, name.as_str(), message.as_str(), position, snippet.trim())],
            );
        }

        // Exceptions always produce a report, so a bare traceback means the
        // guard itself failed
        if rest.contains("Traceback (most recent call last)") {
            let last = rest.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
            return Classification::new(
                OutcomeClass::Crashed,
                VerdictCause::GuardFailure,
                vec![synthetic(CRASHED_ERROR, format!("the runner failed: {}", last))],
            );
        }

        Classification::new(
            OutcomeClass::RuntimeError,
            VerdictCause::NonzeroExit,
            vec![synthetic(
                SYSTEM_EXIT_ERROR,
                format!("the program exited with status {}", status),
            )],
        )
    }

    fn wall_deadline(limits: &ExecutionLimits) -> Classification {
        Self::timeout(
            VerdictCause::WallDeadline,
            format!(
                "execution did not finish within {} ms and was stopped",
                limits.timeout.as_millis()
            ),
        )
    }

    fn timeout(cause: VerdictCause, message: String) -> Classification {
        Classification::new(OutcomeClass::Timeout, cause, vec![synthetic(TIMEOUT_ERROR, message)])
    }

    fn memory(cause: VerdictCause, limits: &ExecutionLimits) -> Classification {
        Classification::new(
            OutcomeClass::MemoryLimit,
            cause,
            vec![synthetic(
                MEMORY_LIMIT_ERROR,
                format!(
                    "the program used more than the {} MB memory limit",
                    limits.memory_cap / (1024 * 1024)
                ),
            )],
        )
    }

    fn security(cause: VerdictCause, violation: Option<(String, Option<String>)>) -> Classification {
        let message = match &violation {
            Some((action, Some(target))) => format!("blocked restricted operation {} on {}", action, target),
            Some((action, None)) => format!("blocked restricted operation {}", action),
            None => "blocked restricted operation".to_string(),
        };
        let mut classification = Classification::new(
            OutcomeClass::Security,
            cause,
            vec![synthetic(SECURITY_ERROR, message)],
        );
        classification.violation = violation;
        classification
    }
}

/// A permission or network error raised by the kernel controls rather than
/// the guard: EACCES/EPERM on an absolute path or with no path at all, or an
/// unreachable network. Relative paths resolve inside scratch and stay
/// ordinary runtime errors.
fn kernel_denial(name: &str, message: &str) -> Option<(String, Option<String>)> {
    if !matches!(name, "PermissionError" | "OSError") {
        return None;
    }
    let (errno, detail) = message.strip_prefix("[Errno ")?.split_once("] ")?;
    let errno: i32 = errno.parse().ok()?;
    let target = detail
        .split_once(": ")
        .map(|(_, target)| target.trim().trim_matches('\'').to_string());

    match errno {
        libc::ENETUNREACH => Some(("network".to_string(), None)),
        libc::EACCES | libc::EPERM => match target {
            Some(path) if path.starts_with('/') => Some(("kernel-denied access".to_string(), Some(path))),
            Some(_) => None,
            None => Some(("kernel-denied operation".to_string(), None)),
        },
        _ => None,
    }
}

/// Run-level error with no source position
pub fn synthetic(name: &str, message: String) -> Error {
    Error::new(ErrorKind::Runtime, name, message, Position::unattributed(), "")
}

fn source_line(code: &str, line: u32) -> String {
    if line == 0 {
        return String::new();
    }
    code.split('\n')
        .nth(line as usize - 1)
        .map(|l| l.trim_end_matches('\r').to_string())
        .unwrap_or_default()
}

/// Column span from the guard (1-based, exclusive end). Unknown columns cover
/// the line's text.
fn span_position(line: u32, column: u32, end_column: u32, text: &str) -> Position {
    if line == 0 {
        return Position::unattributed();
    }
    if column == 0 {
        let indent = text.len() - text.trim_start().len();
        let width = text.trim().chars().count().max(1) as u32;
        return Position::new(line, indent as u32 + 1, width);
    }
    let length = end_column.saturating_sub(column).max(1);
    Position::new(line, column, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::REPORT_MARKER;
    use std::time::Duration;

    fn outcome(exit: ExitKind, stderr: &str) -> BoundaryOutcome {
        BoundaryOutcome {
            exit,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            truncated: false,
            wall_time: Duration::from_millis(20),
            cpu_time: Duration::from_millis(10),
            memory_peak: 0,
            kill_report: None,
        }
    }

    fn report(json: &str) -> String {
        format!("{}{}\n", REPORT_MARKER, json)
    }

    #[test]
    fn test_clean_exit_is_ok() {
        let c = VerdictClassifier::classify(&outcome(ExitKind::Exited(0), ""), &ExecutionLimits::default(), "");
        assert_eq!(c.outcome, OutcomeClass::Ok);
        assert!(c.errors.is_empty());
    }

    #[test]
    fn test_exception_report_becomes_runtime_error() {
        let stderr = report(
            r#"{"event":"exception","type":"ZeroDivisionError","message":"division by zero","line":1,"column":5,"end_column":8}"#,
        );
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(1), &stderr),
            &ExecutionLimits::default(),
            "x = 1/0",
        );
        assert_eq!(c.outcome, OutcomeClass::RuntimeError);
        assert_eq!(c.cause, VerdictCause::UncaughtException);
        let err = &c.errors[0];
        assert_eq!(err.name, "ZeroDivisionError");
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert_eq!(err.position, Position::new(1, 5, 3));
        assert_eq!(err.snippet, "x = 1/0");
    }

    #[test]
    fn test_wall_deadline_is_timeout() {
        let c = VerdictClassifier::classify(&outcome(ExitKind::TimedOut, ""), &ExecutionLimits::default(), "");
        assert_eq!(c.outcome, OutcomeClass::Timeout);
        assert_eq!(c.errors.len(), 1);
        assert_eq!(c.errors[0].name, TIMEOUT_ERROR);
        assert_eq!(c.errors[0].position.line, 0);
    }

    #[test]
    fn test_cpu_signals_are_timeouts() {
        let limits = ExecutionLimits::default();
        let c = VerdictClassifier::classify(&outcome(ExitKind::Signaled(libc::SIGXCPU), ""), &limits, "");
        assert_eq!(c.cause, VerdictCause::CpuLimitSignal);

        let mut killed = outcome(ExitKind::Signaled(libc::SIGKILL), "");
        killed.cpu_time = limits.cpu_cap + Duration::from_millis(900);
        let c = VerdictClassifier::classify(&killed, &limits, "");
        assert_eq!(c.outcome, OutcomeClass::Timeout);
        assert_eq!(c.cause, VerdictCause::CpuLimitKill);
    }

    #[test]
    fn test_memory_exit_and_unattributed_kill() {
        let limits = ExecutionLimits::default();
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(MEMORY_EXIT_CODE), &report(r#"{"event":"memory"}"#)),
            &limits,
            "",
        );
        assert_eq!(c.outcome, OutcomeClass::MemoryLimit);
        assert_eq!(c.errors[0].name, MEMORY_LIMIT_ERROR);

        let c = VerdictClassifier::classify(&outcome(ExitKind::Signaled(libc::SIGKILL), ""), &limits, "");
        assert_eq!(c.outcome, OutcomeClass::MemoryLimit);
        assert_eq!(c.cause, VerdictCause::UnattributedKill);
    }

    #[test]
    fn test_security_report_wins_over_exit_status() {
        let stderr = report(r#"{"event":"security","action":"open","target":"/etc/passwd"}"#);
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(SECURITY_EXIT_CODE), &stderr),
            &ExecutionLimits::default(),
            "open('/etc/passwd')",
        );
        assert_eq!(c.outcome, OutcomeClass::Security);
        assert_eq!(c.errors[0].name, SECURITY_ERROR);
        assert_eq!(
            c.violation,
            Some(("open".to_string(), Some("/etc/passwd".to_string())))
        );
    }

    #[test]
    fn test_kernel_denials_are_security() {
        let limits = ExecutionLimits::default();
        let read = report(
            r#"{"event":"exception","type":"PermissionError","message":"[Errno 13] Permission denied: '/etc/hostname'","line":1,"column":1,"end_column":20}"#,
        );
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(1), &read),
            &limits,
            "open('/etc/hostname').read()",
        );
        assert_eq!(c.outcome, OutcomeClass::Security);
        assert_eq!(c.cause, VerdictCause::KernelDenial);
        assert_eq!(c.errors[0].name, SECURITY_ERROR);
        assert_eq!(
            c.violation,
            Some(("kernel-denied access".to_string(), Some("/etc/hostname".to_string())))
        );

        let net = report(
            r#"{"event":"exception","type":"OSError","message":"[Errno 101] Network is unreachable","line":3,"column":1,"end_column":10}"#,
        );
        let c = VerdictClassifier::classify(&outcome(ExitKind::Exited(1), &net), &limits, "");
        assert_eq!(c.outcome, OutcomeClass::Security);
        assert_eq!(c.violation, Some(("network".to_string(), None)));
    }

    #[test]
    fn test_permission_error_inside_scratch_stays_runtime() {
        let stderr = report(
            r#"{"event":"exception","type":"PermissionError","message":"[Errno 13] Permission denied: 'notes.txt'","line":2,"column":1,"end_column":10}"#,
        );
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(1), &stderr),
            &ExecutionLimits::default(),
            "import os\nopen('notes.txt')",
        );
        assert_eq!(c.outcome, OutcomeClass::RuntimeError);
        assert_eq!(c.errors[0].name, "PermissionError");
    }

    #[test]
    fn test_other_signal_is_crash() {
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Signaled(libc::SIGSEGV), ""),
            &ExecutionLimits::default(),
            "",
        );
        assert_eq!(c.outcome, OutcomeClass::Crashed);
        assert_eq!(c.errors[0].name, CRASHED_ERROR);
    }

    #[test]
    fn test_bare_nonzero_exit_is_system_exit() {
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(3), ""),
            &ExecutionLimits::default(),
            "import sys\nsys.exit(3)",
        );
        assert_eq!(c.outcome, OutcomeClass::RuntimeError);
        assert_eq!(c.errors[0].name, SYSTEM_EXIT_ERROR);
    }

    #[test]
    fn test_traceback_without_report_is_guard_failure() {
        let stderr = "Traceback (most recent call last):\n  File \"guard.py\", line 1\nAttributeError: boom\n";
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(1), stderr),
            &ExecutionLimits::default(),
            "",
        );
        assert_eq!(c.outcome, OutcomeClass::Crashed);
        assert_eq!(c.cause, VerdictCause::GuardFailure);
    }

    #[test]
    fn test_unknown_column_spans_line_text() {
        let stderr = report(
            r#"{"event":"exception","type":"NameError","message":"name 'y' is not defined","line":2,"column":0,"end_column":0}"#,
        );
        let c = VerdictClassifier::classify(
            &outcome(ExitKind::Exited(1), &stderr),
            &ExecutionLimits::default(),
            "if True:\n    print(y)",
        );
        assert_eq!(c.errors[0].position, Position::new(2, 5, 8));
    }

    #[test]
    fn test_start_failure() {
        let c = Classification::start_failure("spawn failed");
        assert_eq!(c.outcome, OutcomeClass::BoundaryFailure);
        assert_eq!(c.errors[0].name, SANDBOX_UNAVAILABLE_ERROR);
        assert_eq!(c.errors[0].kind, ErrorKind::Runtime);
    }
}
