/// Child-side isolation setup
///
/// Applied between fork and exec of the interpreter, in this order:
/// 1. parent-death signal
/// 2. new user + network namespace (when the host allows it)
/// 3. rlimit set (address space, CPU, processes, file size, descriptors, core) and umask
/// 4. no-new-privs
/// 5. landlock filesystem ruleset (built in the parent, enforced here)
///
/// Code in the closure runs in a forked child of a multi-threaded process, so
/// it only issues syscalls and reports failures as raw OS errors.
use crate::config::types::{ExecutionLimits, ExplainError, Result};
use crate::observability::audit;
use landlock::{
    Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, RulesetStatus, ABI,
};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

const LANDLOCK_ABI: ABI = ABI::V3;

/// Which isolation controls the host actually supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlReport {
    pub user_net_namespace: bool,
    pub landlock: bool,
}

impl ControlReport {
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.user_net_namespace {
            missing.push("network_namespace");
        }
        if !self.landlock {
            missing.push("landlock");
        }
        missing
    }
}

/// Probe isolation controls once at startup.
///
/// Strict mode turns any missing control into a configuration error;
/// permissive mode records `ControlDegraded` and continues.
pub fn probe_controls(strict_mode: bool) -> Result<ControlReport> {
    let report = ControlReport {
        user_net_namespace: probe_user_net_namespace(),
        landlock: probe_landlock(),
    };

    let missing = report.missing();
    if missing.is_empty() {
        log::info!("All isolation controls available");
        return Ok(report);
    }

    if strict_mode {
        return Err(ExplainError::Config(format!(
            "strict mode requires isolation controls that this host does not provide: {}",
            missing.join(", ")
        )));
    }

    for control in missing {
        audit::events::control_degraded(control, "not supported by this host");
    }
    Ok(report)
}

fn probe_user_net_namespace() -> bool {
    // unshare(CLONE_NEWUSER) needs a single-threaded caller, so try it in a child
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = match unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            matches!(waitpid(child, None), Ok(WaitStatus::Exited(_, 0)))
        }
        Err(e) => {
            log::warn!("fork for namespace probe failed: {}", e);
            false
        }
    }
}

fn probe_landlock() -> bool {
    // Restriction is per-thread; a throwaway thread keeps the caller unrestricted
    std::thread::spawn(|| {
        let status = Ruleset::default()
            .handle_access(AccessFs::from_all(LANDLOCK_ABI))
            .and_then(|ruleset| ruleset.create())
            .and_then(|ruleset| ruleset.restrict_self());
        matches!(
            status.map(|s| s.ruleset),
            Ok(RulesetStatus::FullyEnforced) | Ok(RulesetStatus::PartiallyEnforced)
        )
    })
    .join()
    .unwrap_or(false)
}

/// Build the filesystem ruleset: read/execute under `read_roots`, full access under `scratch`.
pub fn build_landlock_ruleset(scratch: &Path, read_roots: &[PathBuf]) -> Result<RulesetCreated> {
    let landlock_err = |e: landlock::RulesetError| ExplainError::Boundary(format!("landlock: {}", e));

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .map_err(landlock_err)?
        .create()
        .map_err(landlock_err)?;

    for root in read_roots {
        let fd = match PathFd::new(root) {
            Ok(fd) => fd,
            Err(e) => {
                log::debug!("Skipping read root {}: {}", root.display(), e);
                continue;
            }
        };
        let access = if root.is_dir() {
            AccessFs::from_read(LANDLOCK_ABI)
        } else {
            AccessFs::ReadFile | AccessFs::Execute
        };
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, access))
            .map_err(landlock_err)?;
    }

    let scratch_fd = PathFd::new(scratch)
        .map_err(|e| ExplainError::Boundary(format!("landlock scratch {}: {}", scratch.display(), e)))?;
    ruleset
        .add_rule(PathBeneath::new(scratch_fd, AccessFs::from_all(LANDLOCK_ABI)))
        .map_err(landlock_err)
}

/// Resource limits applied in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitPlan {
    pub address_space: u64,
    /// Soft CPU limit in whole seconds; the hard limit is one second later
    pub cpu_seconds: u64,
    pub file_size: u64,
    pub open_files: u64,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ExecutionLimits) -> Self {
        let cpu_ms = limits.cpu_cap.as_millis() as u64;
        Self {
            address_space: limits.memory_cap,
            cpu_seconds: ((cpu_ms + 999) / 1000).max(1),
            file_size: limits.max_file_size,
            open_files: limits.max_open_files,
        }
    }
}

/// Everything the child needs between fork and exec
pub struct ChildSetup {
    pub rlimits: RlimitPlan,
    pub isolate_network: bool,
    pub landlock: Option<RulesetCreated>,
    pub strict_mode: bool,
}

impl ChildSetup {
    /// Register the setup as the command's pre-exec hook
    pub fn install(self, cmd: &mut Command) {
        let rlimits = self.rlimits;
        let isolate_network = self.isolate_network;
        let strict_mode = self.strict_mode;
        let landlock = Mutex::new(self.landlock);
        let parent = unsafe { libc::getpid() };

        unsafe {
            cmd.pre_exec(move || {
                setup_parent_death_signal(parent)?;

                if isolate_network {
                    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
                        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                }

                apply_rlimits(&rlimits, strict_mode)?;

                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }

                let ruleset = landlock.lock().ok().and_then(|mut slot| slot.take());
                if let Some(ruleset) = ruleset {
                    ruleset
                        .restrict_self()
                        .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))?;
                }

                Ok(())
            });
        }
    }
}

fn setup_parent_death_signal(parent: libc::pid_t) -> io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // Parent may already be gone
    if unsafe { libc::getppid() } != parent {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    Ok(())
}

fn apply_rlimits(plan: &RlimitPlan, strict_mode: bool) -> io::Result<()> {
    // Primary limits are never optional
    apply_rlimit_value(libc::RLIMIT_AS, plan.address_space, plan.address_space, true)?;
    apply_rlimit_value(libc::RLIMIT_CPU, plan.cpu_seconds, plan.cpu_seconds + 1, true)?;
    apply_rlimit_value(libc::RLIMIT_NPROC, 0, 0, true)?;

    apply_rlimit_value(libc::RLIMIT_FSIZE, plan.file_size, plan.file_size, strict_mode)?;
    apply_rlimit_value(libc::RLIMIT_NOFILE, plan.open_files, plan.open_files, strict_mode)?;
    apply_rlimit_value(libc::RLIMIT_CORE, 0, 0, strict_mode)?;

    unsafe {
        libc::umask(0o077);
    }
    Ok(())
}

fn apply_rlimit_value(
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
    required: bool,
) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 || !required {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cpu_seconds_round_up() {
        let mut limits = ExecutionLimits::default();
        limits.cpu_cap = Duration::from_millis(1500);
        assert_eq!(RlimitPlan::from_limits(&limits).cpu_seconds, 2);

        limits.cpu_cap = Duration::from_millis(10);
        assert_eq!(RlimitPlan::from_limits(&limits).cpu_seconds, 1);
    }

    #[test]
    fn test_control_report_missing() {
        let report = ControlReport {
            user_net_namespace: false,
            landlock: true,
        };
        assert_eq!(report.missing(), vec!["network_namespace"]);
        assert!(ControlReport {
            user_net_namespace: true,
            landlock: true
        }
        .missing()
        .is_empty());
    }

    #[test]
    fn test_probe_is_permissive_by_default() {
        // Must never fail in permissive mode, whatever the host supports
        assert!(probe_controls(false).is_ok());
    }

    #[test]
    fn test_ruleset_builds_for_existing_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let roots = vec![PathBuf::from("/usr"), PathBuf::from("/nonexistent-root")];
        assert!(build_landlock_ruleset(scratch.path(), &roots).is_ok());
    }

    #[test]
    fn test_child_setup_applies_rlimits() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("ulimit -c");
        ChildSetup {
            rlimits: RlimitPlan {
                address_space: 512 * 1024 * 1024,
                cpu_seconds: 5,
                file_size: 1024 * 1024,
                open_files: 32,
            },
            isolate_network: false,
            landlock: None,
            strict_mode: false,
        }
        .install(&mut cmd);

        // NPROC=0 may prevent /bin/sh from forking, but `ulimit` is a builtin
        let output = match cmd.output() {
            Ok(output) => output,
            Err(_) => return,
        };
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");
    }
}
