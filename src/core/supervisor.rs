use crate::config::config::SandboxConfig;
use crate::config::types::{ExecutionLimits, ExplainError, Result};
use crate::core::boundary::{BoundaryOutcome, ExitKind, IsolatedExecutionBoundary, KillReport};
use crate::core::runner::{default_read_roots, GUARD_SCRIPT};
use crate::exec::preexec::{build_landlock_ruleset, probe_controls, ChildSetup, ControlReport, RlimitPlan};
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::safety::workspace::{Workspace, WorkspaceManager, RUNNER_FILE, SOURCE_FILE};
use crate::utils::output::OutputCollector;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long reader threads get to hit EOF once the process group is gone
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Boundary backed by a restricted interpreter process
pub struct ProcessBoundary {
    interpreter: PathBuf,
    interpreter_args: Vec<String>,
    read_roots: Vec<PathBuf>,
    workspaces: WorkspaceManager,
    controls: ControlReport,
    strict_mode: bool,
}

/// A running boundary process.
///
/// The parent-death signal is tied to the spawning thread, so `wait_or_kill`
/// has to run on the thread that called `spawn`.
pub struct ProcessHandle {
    pid: libc::pid_t,
    run_id: String,
    started: Instant,
    reaped: bool,
    collector: Option<OutputCollector>,
    workspace: Option<Workspace>,
}

impl ProcessHandle {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!("Boundary handle {} dropped while running, killing", self.run_id);
            kill_process_group(self.pid);
            let _ = wait4(self.pid, 0);
            self.reaped = true;
        }
        // Collector and workspace release themselves on drop
    }
}

impl ProcessBoundary {
    /// Probe host controls and prepare the scratch root.
    ///
    /// In strict mode a missing isolation control is an error here, before any
    /// snippet runs.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        if !config.interpreter.exists() {
            log::warn!(
                "Interpreter {} not found, every run will report SandboxUnavailable",
                config.interpreter.display()
            );
        }

        let controls = probe_controls(config.strict_mode)?;
        let read_roots = if config.read_only_paths.is_empty() {
            default_read_roots(&config.interpreter)
        } else {
            config.read_only_paths.clone()
        };
        let workspaces = WorkspaceManager::new(config.scratch_root.clone())?;

        log::debug!(
            "Process boundary ready: interpreter={} read_roots={:?} controls={:?}",
            config.interpreter.display(),
            read_roots,
            controls
        );

        Ok(Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            read_roots,
            workspaces,
            controls,
            strict_mode: config.strict_mode,
        })
    }

    pub fn controls(&self) -> ControlReport {
        self.controls
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    fn landlock_for(&self, workspace: &Workspace) -> Result<Option<landlock::RulesetCreated>> {
        if !self.controls.landlock {
            return Ok(None);
        }
        match build_landlock_ruleset(workspace.run_dir(), &self.read_roots) {
            Ok(ruleset) => Ok(Some(ruleset)),
            Err(e) if !self.strict_mode => {
                log::warn!("Running without landlock for {}: {}", workspace.run_id(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl IsolatedExecutionBoundary for ProcessBoundary {
    type Handle = ProcessHandle;

    fn spawn(&self, code: &str, limits: &ExecutionLimits) -> Result<ProcessHandle> {
        let workspace = self.workspaces.create_workspace()?;
        let source = workspace.write_file(SOURCE_FILE, code.as_bytes())?;
        let runner = workspace.write_file(RUNNER_FILE, GUARD_SCRIPT.as_bytes())?;
        let scratch = workspace.run_dir().to_path_buf();

        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(&runner)
            .arg(&scratch)
            .arg(&source)
            .args(&self.read_roots)
            .current_dir(&scratch)
            .env_clear()
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        ChildSetup {
            rlimits: RlimitPlan::from_limits(limits),
            isolate_network: self.controls.user_net_namespace,
            landlock: self.landlock_for(&workspace)?,
            strict_mode: self.strict_mode,
        }
        .install(&mut cmd);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            ExplainError::Boundary(format!("spawn {}: {}", self.interpreter.display(), e))
        })?;

        let pid = child.id() as libc::pid_t;
        let collector = OutputCollector::start(
            child.stdout.take(),
            child.stderr.take(),
            limits.max_output_bytes,
        );

        log::debug!("Boundary run {} started as pid {}", workspace.run_id(), pid);

        Ok(ProcessHandle {
            pid,
            run_id: workspace.run_id().to_string(),
            started,
            reaped: false,
            collector: Some(collector),
            workspace: Some(workspace),
        })
    }

    fn wait_or_kill(&self, mut handle: ProcessHandle, timeout: Duration) -> Result<BoundaryOutcome> {
        let deadline = handle.started + timeout;
        let mut kill_report: Option<KillReport> = None;

        let waited = loop {
            // Only output that arrived before the deadline is trusted
            if Instant::now() < deadline {
                if let Some(collector) = handle.collector.as_mut() {
                    collector.drain();
                }
            }

            match wait4(handle.pid, libc::WNOHANG) {
                Ok(Some(done)) => break Ok(done),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let kill_started = Instant::now();
                        let mut report = kill_process_group(handle.pid);
                        let done = wait4(handle.pid, 0);
                        report.waited_ms = kill_started.elapsed().as_millis() as u64;
                        kill_report = Some(report);

                        audit::events::forced_kill(
                            CorrelationIds::new()
                                .with_run_id(&handle.run_id)
                                .with_root_pid(handle.pid as u32),
                            "wall deadline reached",
                        );

                        break done.and_then(|d| {
                            d.ok_or_else(|| ExplainError::Process("wait4 returned no status".to_string()))
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => break Err(e),
            }
        };

        // Either reaped, or wait4 reported the pid is not ours to wait on
        handle.reaped = true;
        let wall_time = handle.started.elapsed();
        let timed_out = kill_report.is_some();

        let output = handle
            .collector
            .take()
            .map(|collector| collector.finish(OUTPUT_GRACE, !timed_out))
            .unwrap_or_default();
        if output.discarded_bytes > 0 {
            log::debug!(
                "Discarded {} bytes received after the deadline for run {}",
                output.discarded_bytes,
                handle.run_id
            );
        }

        if let Some(workspace) = handle.workspace.take() {
            if let Err(e) = workspace.cleanup() {
                get_metrics().cleanup_failures.inc();
                audit::events::cleanup_failure(
                    CorrelationIds::new().with_run_id(workspace.run_id()),
                    &e.to_string(),
                );
            }
        }

        let (status, usage) = waited?;
        let exit = if timed_out {
            ExitKind::TimedOut
        } else if libc::WIFEXITED(status) {
            ExitKind::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitKind::Signaled(libc::WTERMSIG(status))
        } else {
            return Err(ExplainError::Process(format!(
                "unexpected wait status {:#x} for run {}",
                status, handle.run_id
            )));
        };

        Ok(BoundaryOutcome {
            exit,
            stdout: output.stdout,
            stderr: output.stderr,
            truncated: output.truncated,
            wall_time,
            cpu_time: timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime),
            memory_peak: (usage.ru_maxrss.max(0) as u64) * 1024,
            kill_report,
        })
    }

    fn describe(&self) -> String {
        format!("process:{}", self.interpreter.display())
    }
}

fn kill_process_group(pid: libc::pid_t) -> KillReport {
    let mut report = KillReport::default();

    let kill_rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if kill_rc != 0 {
        let group_err = io::Error::last_os_error();
        let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
        report
            .notes
            .push(format!("group SIGKILL fallback used: {}", group_err));
    }
    report.kill_sent = true;
    report
}

/// `wait4` with EINTR retry. `Ok(None)` means still running (only with `WNOHANG`).
fn wait4(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<(libc::c_int, libc::rusage)>> {
    loop {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid, &mut status, flags, &mut usage) };

        if rc == pid {
            return Ok(Some((status, usage)));
        }
        if rc == 0 {
            return Ok(None);
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(ExplainError::Process(format!("wait4({}): {}", pid, err)));
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_boundary(scratch: &Path) -> Option<ProcessBoundary> {
        if !Path::new("/usr/bin/python3").exists() {
            return None;
        }
        let config = SandboxConfig {
            scratch_root: scratch.to_path_buf(),
            ..SandboxConfig::default()
        };
        ProcessBoundary::from_config(&config).ok()
    }

    fn run(boundary: &ProcessBoundary, code: &str, timeout: Duration) -> BoundaryOutcome {
        let limits = ExecutionLimits {
            timeout,
            ..ExecutionLimits::default()
        };
        let handle = boundary.spawn(code, &limits).unwrap();
        boundary.wait_or_kill(handle, timeout).unwrap()
    }

    #[test]
    fn test_prints_and_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let Some(boundary) = test_boundary(dir.path()) else {
            return;
        };

        let outcome = run(&boundary, "print('hello')", Duration::from_secs(5));
        assert_eq!(outcome.exit, ExitKind::Exited(0));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "hello\n");
        assert!(outcome.kill_report.is_none());
    }

    #[test]
    fn test_deadline_kills_and_discards_late_output() {
        let dir = tempfile::tempdir().unwrap();
        let Some(boundary) = test_boundary(dir.path()) else {
            return;
        };

        let outcome = run(&boundary, "while True:\n    pass\n", Duration::from_millis(300));
        assert_eq!(outcome.exit, ExitKind::TimedOut);
        assert!(outcome.wall_time < Duration::from_secs(2));
        assert!(outcome.kill_report.as_ref().map(|r| r.kill_sent).unwrap_or(false));
    }

    #[test]
    fn test_workspace_removed_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let Some(boundary) = test_boundary(dir.path()) else {
            return;
        };

        run(&boundary, "open('scratch.txt', 'w').write('x')", Duration::from_secs(5));
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_dropped_handle_is_killed_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let Some(boundary) = test_boundary(dir.path()) else {
            return;
        };

        let handle = boundary
            .spawn("import time\ntime.sleep(30)\n", &ExecutionLimits::default())
            .unwrap();
        let pid = handle.pid();
        drop(handle);

        // Reaped, so the pid no longer names our child
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
