/// Sandbox facade: run a snippet through a boundary and classify the result
use crate::config::types::{ExecutionLimits, ExecutionResult, OutcomeClass};
use crate::core::boundary::{BoundaryOutcome, IsolatedExecutionBoundary};
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::verdict::{Classification, VerdictCause, VerdictClassifier};
use std::time::{Duration, Instant};

pub struct Sandbox<B: IsolatedExecutionBoundary> {
    boundary: B,
    limits: ExecutionLimits,
}

impl<B: IsolatedExecutionBoundary> Sandbox<B> {
    pub fn new(boundary: B, limits: ExecutionLimits) -> Self {
        Self { boundary, limits }
    }

    pub fn boundary(&self) -> &B {
        &self.boundary
    }

    /// Limits used when the caller does not pass its own
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Execute `code` under `limits`. Never fails: start and collection
    /// failures come back as a classified synthetic error.
    pub fn execute(&self, code: &str, limits: &ExecutionLimits) -> ExecutionResult {
        self.execute_traced(code, limits, CorrelationIds::new())
    }

    pub fn execute_traced(
        &self,
        code: &str,
        limits: &ExecutionLimits,
        correlation: CorrelationIds,
    ) -> ExecutionResult {
        audit::events::execution_start(correlation.clone(), &self.boundary.describe());
        let started = Instant::now();

        let (classification, outcome) = match self.run(code, limits) {
            Ok(outcome) => (VerdictClassifier::classify(&outcome, limits, code), Some(outcome)),
            Err(classification) => (classification, None),
        };

        let wall_time = outcome
            .as_ref()
            .map(|o| o.wall_time)
            .unwrap_or_else(|| started.elapsed());
        let memory_peak = outcome.as_ref().map(|o| o.memory_peak).unwrap_or(0);

        self.audit_outcome(&classification, outcome.as_ref(), limits, &correlation);
        get_metrics().record_execution(classification.outcome, wall_time);
        audit::events::execution_end(
            correlation,
            classification.outcome,
            wall_time.as_millis() as u64,
        );

        let stdout = outcome
            .as_ref()
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();

        ExecutionResult {
            succeeded: classification.outcome == OutcomeClass::Ok,
            stdout,
            errors: classification.errors,
            wall_time,
            memory_peak,
            outcome: classification.outcome,
        }
    }

    fn run(&self, code: &str, limits: &ExecutionLimits) -> Result<BoundaryOutcome, Classification> {
        let handle = self.boundary.spawn(code, limits).map_err(|e| {
            log::error!("Sandbox start failed: {}", e);
            Classification::start_failure(&e.to_string())
        })?;

        self.boundary.wait_or_kill(handle, limits.timeout).map_err(|e| {
            log::error!("Sandbox result collection failed: {}", e);
            Classification::collection_failure(&e.to_string())
        })
    }

    fn audit_outcome(
        &self,
        classification: &Classification,
        outcome: Option<&BoundaryOutcome>,
        limits: &ExecutionLimits,
        correlation: &CorrelationIds,
    ) {
        let millis = |d: Duration| d.as_millis() as u64;

        match (classification.outcome, classification.cause) {
            (OutcomeClass::Timeout, VerdictCause::WallDeadline) => {
                let used = outcome.map(|o| o.wall_time).unwrap_or_default();
                audit::events::wall_time_limit_violation(
                    correlation.clone(),
                    millis(used),
                    millis(limits.timeout),
                );
            }
            (OutcomeClass::Timeout, _) => {
                let used = outcome.map(|o| o.cpu_time).unwrap_or_default();
                audit::events::cpu_limit_violation(
                    correlation.clone(),
                    millis(used),
                    millis(limits.cpu_cap),
                );
            }
            (OutcomeClass::MemoryLimit, _) => {
                let peak = outcome.map(|o| o.memory_peak).unwrap_or(0);
                audit::events::memory_limit_violation(correlation.clone(), peak, limits.memory_cap);
            }
            (OutcomeClass::Security, _) => {
                let (action, target) = match &classification.violation {
                    Some((action, target)) => (action.as_str(), target.as_deref()),
                    None => ("unknown", None),
                };
                audit::events::security_violation(correlation.clone(), action, target);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::types::{ExplainError, Result};
    use crate::core::boundary::ExitKind;
    use crate::core::runner::REPORT_MARKER;
    use crate::verdict::classifier::{SANDBOX_UNAVAILABLE_ERROR, SECURITY_ERROR, TIMEOUT_ERROR};

    /// Boundary that returns a canned outcome without running anything
    pub(crate) struct ScriptedBoundary {
        pub exit: Option<ExitKind>,
        pub stdout: &'static str,
        pub stderr: String,
    }

    impl IsolatedExecutionBoundary for ScriptedBoundary {
        type Handle = ();

        fn spawn(&self, _code: &str, _limits: &ExecutionLimits) -> Result<()> {
            match self.exit {
                Some(_) => Ok(()),
                None => Err(ExplainError::Boundary("interpreter missing".to_string())),
            }
        }

        fn wait_or_kill(&self, _handle: (), _timeout: Duration) -> Result<BoundaryOutcome> {
            Ok(BoundaryOutcome {
                exit: self.exit.unwrap_or(ExitKind::Exited(0)),
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: self.stderr.as_bytes().to_vec(),
                truncated: false,
                wall_time: Duration::from_millis(15),
                cpu_time: Duration::from_millis(5),
                memory_peak: 4096,
                kill_report: None,
            })
        }
    }

    fn sandbox(exit: Option<ExitKind>, stdout: &'static str, stderr: String) -> Sandbox<ScriptedBoundary> {
        Sandbox::new(
            ScriptedBoundary {
                exit,
                stdout,
                stderr,
            },
            ExecutionLimits::default(),
        )
    }

    #[test]
    fn test_successful_run() {
        let sb = sandbox(Some(ExitKind::Exited(0)), "hi\n", String::new());
        let result = sb.execute("print('hi')", sb.limits());
        assert!(result.succeeded);
        assert_eq!(result.stdout, "hi\n");
        assert!(result.errors.is_empty());
        assert_eq!(result.memory_peak, 4096);
    }

    #[test]
    fn test_start_failure_is_single_synthetic_error() {
        let sb = sandbox(None, "", String::new());
        let result = sb.execute("print(1)", sb.limits());
        assert!(!result.succeeded);
        assert_eq!(result.outcome, OutcomeClass::BoundaryFailure);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].name, SANDBOX_UNAVAILABLE_ERROR);
    }

    #[test]
    fn test_timeout_yields_one_timeout_error() {
        let sb = sandbox(Some(ExitKind::TimedOut), "partial", String::new());
        let result = sb.execute("while True: pass", sb.limits());
        assert_eq!(result.outcome, OutcomeClass::Timeout);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].name, TIMEOUT_ERROR);
    }

    #[test]
    fn test_security_violation_is_classified() {
        let stderr = format!(
            "{}{}\n",
            REPORT_MARKER, r#"{"event":"security","action":"socket.__new__","target":null}"#
        );
        let sb = sandbox(Some(ExitKind::Exited(86)), "", stderr);
        let result = sb.execute("import socket; socket.socket()", sb.limits());
        assert_eq!(result.outcome, OutcomeClass::Security);
        assert_eq!(result.errors[0].name, SECURITY_ERROR);
    }
}
