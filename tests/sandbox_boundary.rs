//! Sandbox tests against a real interpreter
//!
//! Every test returns early when /usr/bin/python3 is missing or the boundary
//! cannot be built on this host.

use explainbox::config::config::SandboxConfig;
use explainbox::verdict::classifier::{MEMORY_LIMIT_ERROR, SECURITY_ERROR, TIMEOUT_ERROR};
use explainbox::{ErrorKind, ExecutionLimits, OutcomeClass, ProcessBoundary, Sandbox};
use std::path::Path;
use std::time::{Duration, Instant};

fn sandbox(scratch: &Path) -> Option<Sandbox<ProcessBoundary>> {
    if !Path::new("/usr/bin/python3").exists() {
        return None;
    }
    let config = SandboxConfig {
        scratch_root: scratch.to_path_buf(),
        ..SandboxConfig::default()
    };
    let boundary = ProcessBoundary::from_config(&config).ok()?;
    let limits = ExecutionLimits::from_config(&config).ok()?;
    Some(Sandbox::new(boundary, limits))
}

#[test]
fn test_runtime_error_is_classified_with_position() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    let result = sb.execute("x = 1/0\n", sb.limits());
    assert!(!result.succeeded);
    assert_eq!(result.outcome, OutcomeClass::RuntimeError);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert_eq!(error.name, "ZeroDivisionError");
    assert_eq!(error.position.line, 1);
    assert_eq!(error.snippet, "x = 1/0");
}

#[test]
fn test_timeout_returns_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };
    let limits = ExecutionLimits {
        timeout: Duration::from_millis(500),
        ..sb.limits().clone()
    };

    let started = Instant::now();
    let result = sb.execute("while True:\n    pass\n", &limits);
    assert!(started.elapsed() < limits.timeout + Duration::from_secs(2));
    assert_eq!(result.outcome, OutcomeClass::Timeout);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].name, TIMEOUT_ERROR);
}

#[test]
fn test_reading_host_files_is_a_security_error() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    let result = sb.execute("print(open('/etc/passwd').read())\n", sb.limits());
    assert_eq!(result.outcome, OutcomeClass::Security);
    assert_eq!(result.errors[0].name, SECURITY_ERROR);
    assert!(!result.stdout.contains("root:"));
}

#[test]
fn test_network_access_is_a_security_error() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    let code = "import socket\ns = socket.socket()\ns.connect(('127.0.0.1', 80))\n";
    let result = sb.execute(code, sb.limits());
    assert_eq!(result.outcome, OutcomeClass::Security);
    assert_eq!(result.errors[0].name, SECURITY_ERROR);
}

#[test]
fn test_writing_outside_scratch_leaves_host_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("owned.txt");

    let code = format!("open({:?}, 'w').write('x')\n", target.display().to_string());
    let result = sb.execute(&code, sb.limits());
    assert_eq!(result.outcome, OutcomeClass::Security);
    assert!(!target.exists());
}

#[test]
fn test_scratch_is_removed_after_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    sb.execute("open('notes.txt', 'w').write('hi')\nprint('done')\n", sb.limits());
    sb.execute("raise ValueError('bad')\n", sb.limits());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_snippet_cannot_switch_off_the_guard() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    // Guard state is not reachable through __main__
    let code = "import sys\n\
                busy = getattr(sys.modules['__main__'], '_busy', None)\n\
                if busy is not None:\n    busy[0] = True\n\
                print(open('/etc/passwd').read())\n";
    let result = sb.execute(code, sb.limits());
    assert_eq!(result.outcome, OutcomeClass::Security);
    assert!(!result.stdout.contains("root:"));

    // Patching the modules and builtins the guard used to look up
    let code = "import builtins, os\n\
                builtins.any = lambda *a: True\n\
                os.path.realpath = lambda p: '.'\n\
                print(open('/etc/passwd').read())\n";
    let result = sb.execute(code, sb.limits());
    assert_eq!(result.outcome, OutcomeClass::Security);
    assert_eq!(result.errors[0].name, SECURITY_ERROR);
    assert!(!result.stdout.contains("root:"));
}

#[test]
fn test_allocation_past_the_memory_cap_is_a_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let Some(sb) = sandbox(dir.path()) else {
        return;
    };

    let result = sb.execute("data = bytearray(10**9)\nprint(len(data))\n", sb.limits());
    assert!(!result.succeeded);
    assert_eq!(result.outcome, OutcomeClass::MemoryLimit);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].name, MEMORY_LIMIT_ERROR);
}
