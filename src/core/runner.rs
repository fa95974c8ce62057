/// Guard runner executed inside the boundary
///
/// The interpreter is started on `guard.py`, which compiles the snippet,
/// installs an audit hook restricting what the snippet can reach, runs it, and
/// reports anything the supervisor cannot see from the exit status alone as a
/// marker line on stderr.
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Prefix of a guard report line on stderr
pub const REPORT_MARKER: &str = "\x1eEXPLAINBOX ";

/// Exit code used after a restricted-resource access
pub const SECURITY_EXIT_CODE: i32 = 86;

/// Exit code used after `MemoryError`
pub const MEMORY_EXIT_CODE: i32 = 87;

/// argv: guard.py <scratch_dir> <source_file> [read_root...]
pub const GUARD_SCRIPT: &str = r#"import json
import os
import sys


def _make_hook(scratch, roots, emit, hard_exit):
    # Everything the hook relies on is bound here, so later changes to
    # modules or builtins made by the snippet do not reach it.
    import _thread
    import pathlib

    realpath = os.path.realpath
    join = os.path.join
    fsdecode = os.fsdecode
    fspath = os.fspath
    get_ident = _thread.get_ident
    pure_fspath = pathlib.PurePath.__fspath__
    is_instance = isinstance
    any_of = any
    text = str
    raw_types = (str, bytes)
    devices = frozenset(("/dev/null", "/dev/urandom"))
    roots = frozenset(roots)
    write_flags = os.O_WRONLY | os.O_RDWR | os.O_APPEND | os.O_CREAT | os.O_TRUNC
    denied_prefixes = (
        "socket.", "subprocess.", "_posixsubprocess.", "os.exec", "os.posix_spawn",
        "os.spawn", "os.fork", "os.forkpty", "os.system", "os.kill", "os.killpg",
        "ctypes.", "pty.",
    )
    denied_events = frozenset(("gc.get_objects", "gc.get_referrers", "gc.get_referents"))
    busy = set()

    def under(path, root):
        return path == root or path.startswith(root.rstrip("/") + "/")

    def readable(path):
        if under(path, scratch) or path in devices:
            return True
        return any_of(under(path, root) for root in roots)

    def violation(action, target):
        emit({
            "event": "security",
            "action": action,
            "target": None if target is None else text(target),
        })
        hard_exit(86)

    def resolve(event, target):
        # Only plain paths and pathlib objects; anything else could answer
        # differently when the interpreter asks again
        if not is_instance(target, raw_types) and type(target).__fspath__ is not pure_fspath:
            violation(event, "untrusted path object")
        return realpath(join(scratch, fsdecode(fspath(target))))

    def check(event, args):
        if event.startswith(denied_prefixes) or event in denied_events:
            violation(event, args[0] if args else None)
        if event == "open":
            target, mode, flags = args[0], args[1], args[2]
            if target is None or is_instance(target, int):
                return
            path = resolve(event, target)
            writing = bool((flags or 0) & write_flags) or any_of(c in (mode or "") for c in "wax+")
            if writing and not under(path, scratch):
                violation("write", path)
            if not writing and not readable(path):
                violation("read", path)
            return
        if event.startswith("os.") or event.startswith("shutil."):
            if not args or not is_instance(args[0], (str, bytes, os.PathLike)):
                return
            path = resolve(event, args[0])
            if event in ("os.listdir", "os.scandir"):
                if not readable(path):
                    violation(event, path)
            elif not under(path, scratch):
                violation(event, path)

    def hook(event, args):
        ident = get_ident()
        if ident in busy:
            return
        busy.add(ident)
        try:
            check(event, args)
        finally:
            busy.discard(ident)

    return hook


def _location(exc):
    found = None
    tb = exc.__traceback__
    while tb is not None:
        if tb.tb_frame.f_code.co_filename == "<snippet>":
            found = tb
        tb = tb.tb_next
    if found is None:
        return 0, 0, 0
    line = found.tb_lineno or 0
    column = 0
    end_column = 0
    try:
        pos = list(found.tb_frame.f_code.co_positions())[found.tb_lasti // 2]
        if pos[0] == line and pos[2] is not None:
            column = pos[2] + 1
            if pos[1] == line and pos[3] is not None:
                end_column = pos[3] + 1
    except Exception:
        pass
    return line, column, end_column


def _main():
    import types

    mark = "\x1eEXPLAINBOX "
    dumps = json.dumps
    write = os.write
    hard_exit = os._exit

    def emit(payload):
        write(2, (mark + dumps(payload) + "\n").encode("utf-8", "replace"))

    scratch = os.path.realpath(sys.argv[1])
    source_path = sys.argv[2]
    roots = [os.path.realpath(p) for p in sys.argv[3:]]
    sys.argv = ["<snippet>"]

    with open(source_path, "r", encoding="utf-8") as f:
        src = f.read()

    try:
        code = compile(src, "<snippet>", "exec")
    except SyntaxError as e:
        emit({
            "event": "syntax",
            "type": type(e).__name__,
            "message": e.msg or "invalid syntax",
            "line": e.lineno or 0,
            "column": e.offset or 0,
            "end_column": getattr(e, "end_offset", None) or 0,
        })
        hard_exit(1)

    # The snippet gets a fresh __main__; the guard module is no longer in
    # sys.modules and the hook is referenced only by the interpreter.
    module = types.ModuleType("__main__")
    module.__builtins__ = __builtins__
    sys.modules["__main__"] = module
    sys.addaudithook(_make_hook(scratch, roots, emit, hard_exit))

    try:
        exec(code, module.__dict__)
    except SystemExit:
        raise
    except MemoryError:
        try:
            sys.stdout.flush()
        except Exception:
            pass
        emit({"event": "memory"})
        hard_exit(87)
    except BaseException as e:
        line, column, end_column = _location(e)
        try:
            sys.stdout.flush()
        except Exception:
            pass
        emit({
            "event": "exception",
            "type": type(e).__name__,
            "message": str(e),
            "line": line,
            "column": column,
            "end_column": end_column,
        })
        hard_exit(1)


_main()
"#;

/// Structured report written by the guard runner
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardReport {
    /// The interpreter rejected the snippet at compile time
    Syntax {
        #[serde(rename = "type")]
        name: String,
        message: String,
        line: u32,
        column: u32,
        end_column: u32,
    },
    /// Uncaught exception; column span is 1-based with an exclusive end
    Exception {
        #[serde(rename = "type")]
        name: String,
        message: String,
        line: u32,
        column: u32,
        end_column: u32,
    },
    Memory,
    Security {
        action: String,
        target: Option<String>,
    },
}

/// Split guard reports out of stderr.
///
/// Returns the parsed reports in order and the stderr text with report lines
/// removed. Lines carrying the marker but not valid JSON are kept as text.
pub fn parse_guard_reports(stderr: &str) -> (Vec<GuardReport>, String) {
    let mut reports = Vec::new();
    let mut rest = String::new();

    for line in stderr.split_inclusive('\n') {
        let Some(idx) = line.find(REPORT_MARKER) else {
            rest.push_str(line);
            continue;
        };

        let payload = line[idx + REPORT_MARKER.len()..].trim_end();
        match serde_json::from_str::<GuardReport>(payload) {
            Ok(report) => {
                // Text the snippet wrote without a trailing newline
                rest.push_str(&line[..idx]);
                reports.push(report);
            }
            Err(e) => {
                log::debug!("Unparseable guard report: {}", e);
                rest.push_str(line);
            }
        }
    }

    (reports, rest)
}

const SYSTEM_READ_ROOTS: &[&str] = &[
    "/lib",
    "/lib64",
    "/lib32",
    "/usr/lib",
    "/usr/lib64",
    "/etc/ld.so.cache",
    "/dev/null",
    "/dev/urandom",
];

/// Host paths the interpreter needs to start: its installation prefix and the
/// dynamic loader's libraries. Paths that do not exist are skipped.
pub fn default_read_roots(interpreter: &Path) -> Vec<PathBuf> {
    let resolved = std::fs::canonicalize(interpreter).unwrap_or_else(|_| interpreter.to_path_buf());

    let mut roots = Vec::new();
    let bin_dir = resolved.parent();
    let prefix = bin_dir.and_then(Path::parent);
    match (prefix, bin_dir) {
        (Some(prefix), _) if prefix != Path::new("/") => roots.push(prefix.to_path_buf()),
        (_, Some(bin_dir)) => roots.push(bin_dir.to_path_buf()),
        _ => {}
    }

    for path in SYSTEM_READ_ROOTS {
        let path = PathBuf::from(path);
        if !roots.iter().any(|root| path.starts_with(root)) {
            roots.push(path);
        }
    }

    roots.retain(|path| path.exists());
    roots
}
