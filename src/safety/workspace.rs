/// Run-scoped scratch directories
/// Each boundary run gets its own directory; nothing outlives the run.
use crate::config::types::{ExplainError, Result};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub const SOURCE_FILE: &str = "snippet.py";
pub const RUNNER_FILE: &str = "guard.py";

fn io_context(e: std::io::Error, what: &str, path: &Path) -> ExplainError {
    ExplainError::Io(std::io::Error::new(
        e.kind(),
        format!("Failed to {} {}: {}", what, path.display(), e),
    ))
}

/// Scratch directory for one run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    cleaned: AtomicBool,
}

impl Workspace {
    /// Create a fresh `0700` run directory under `base_dir`
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&run_dir)
            .map_err(|e| io_context(e, "create workspace directory", &run_dir))?;

        Ok(Self {
            run_id,
            run_dir,
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write a file into the run directory (read-only for the snippet)
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.run_dir.join(name);
        fs::write(&path, content).map_err(|e| io_context(e, "write", &path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o400))
            .map_err(|e| io_context(e, "chmod", &path))?;
        Ok(path)
    }

    /// Remove the run directory. Idempotent.
    ///
    /// `remove_dir_all` does not follow symlinks, so links planted by the
    /// snippet are removed rather than traversed.
    pub fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.run_dir.exists() {
            return Ok(());
        }

        // Read-only files inside a writable directory can still be unlinked
        match fs::remove_dir_all(&self.run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.cleaned.store(false, Ordering::SeqCst);
                Err(io_context(e, "remove run directory", &self.run_dir))
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

/// Owner of the scratch root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&base_dir)
            .map_err(|e| io_context(e, "create scratch root", &base_dir))?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove run directories left behind by a crashed process
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        if !self.base_dir.exists() {
            return Ok(0);
        }

        let entries =
            fs::read_dir(&self.base_dir).map_err(|e| io_context(e, "read", &self.base_dir))?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Failed to get metadata for {}: {}", path.display(), e);
                    continue;
                }
            };

            let age = match metadata.modified().map(|m| now.duration_since(m)) {
                Ok(Ok(age)) => age,
                _ => continue,
            };

            if age >= max_age {
                log::info!("Cleaning up stale workspace: {}", path.display());
                match fs::remove_dir_all(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
                }
            }
        }

        Ok(cleaned)
    }
}
