/// JSON snapshot files written atomically
use crate::config::types::{ExplainError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

fn store_err(path: &Path, what: &str, e: impl std::fmt::Display) -> ExplainError {
    ExplainError::Store(format!("{} {}: {}", what, path.display(), e))
}

/// Write `content` to `path` through a temp file in the same directory and a rename
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| store_err(path, "no parent directory for", "invalid path"))?;
    fs::create_dir_all(parent).map_err(|e| store_err(parent, "create", e))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let written = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| store_err(&temp_path, "create", e))?;
        file.write_all(content)
            .map_err(|e| store_err(&temp_path, "write", e))?;
        file.sync_all().map_err(|e| store_err(&temp_path, "sync", e))?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        store_err(path, "rename into", e)
    })
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    entries: Vec<T>,
}

/// One snapshot file. `None` path means the in-memory policy: loads are
/// empty and saves do nothing.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: Option<PathBuf>,
}

impl SnapshotFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Read all entries. A missing file is an empty snapshot.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err(path, "read", e)),
        };

        let envelope: Envelope<T> =
            serde_json::from_slice(&data).map_err(|e| store_err(path, "parse", e))?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(store_err(
                path,
                "unsupported snapshot version in",
                envelope.version,
            ));
        }
        Ok(envelope.entries)
    }

    pub fn save<T: Serialize>(&self, entries: Vec<T>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let envelope = Envelope {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let data = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(path, &data)?;
        log::debug!("Wrote snapshot {}", path.display());
        Ok(())
    }
}
