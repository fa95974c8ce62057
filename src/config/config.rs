/// Configuration loading from explainbox.json
use crate::config::types::{ExecutionLimits, ExplainError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "explainbox.json";

/// Full explainbox.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainboxConfig {
    pub sandbox: SandboxConfig,
    pub cache: CacheConfig,
    pub history: HistoryConfig,
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter executable
    pub interpreter: PathBuf,
    /// Flags passed before the guard runner
    pub interpreter_args: Vec<String>,
    /// Wall clock limit (required)
    pub timeout_ms: Option<u64>,
    /// Address space cap in bytes (required)
    pub memory_cap_bytes: Option<u64>,
    /// CPU time cap (required)
    pub cpu_cap_ms: Option<u64>,
    pub max_output_bytes: usize,
    pub max_file_size_bytes: u64,
    pub max_open_files: u64,
    /// Parent directory for per-run scratch directories
    pub scratch_root: PathBuf,
    /// Host paths the interpreter may read. Empty means derive from the interpreter location.
    pub read_only_paths: Vec<PathBuf>,
    /// Fail at startup when an isolation control cannot be applied
    pub strict_mode: bool,
}

impl SandboxConfig {
    /// Runtime root directory scoped by effective UID.
    pub fn default_scratch_root() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("explainbox-uid-{}", euid))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("/usr/bin/python3"),
            interpreter_args: vec!["-I".to_string(), "-S".to_string(), "-B".to_string()],
            timeout_ms: Some(5_000),
            memory_cap_bytes: Some(256 * 1024 * 1024),
            cpu_cap_ms: Some(3_000),
            max_output_bytes: 64 * 1024,
            max_file_size_bytes: 1024 * 1024,
            max_open_files: 64,
            scratch_root: Self::default_scratch_root(),
            read_only_paths: Vec::new(),
            strict_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: 7 * 24 * 3600,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_days: u64,
    pub top_k: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            top_k: 5,
        }
    }
}

/// Whether cache and history survive a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    #[serde(rename = "durable")]
    Durable,
    #[serde(rename = "in_memory")]
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub durability: Durability,
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn cache_path(&self) -> Option<PathBuf> {
        match self.durability {
            Durability::Durable => Some(self.data_dir.join("cache.json")),
            Durability::InMemory => None,
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        match self.durability {
            Durability::Durable => Some(self.data_dir.join("history.json")),
            Durability::InMemory => None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(".explainbox");
        Self {
            durability: Durability::Durable,
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay that is randomized, 0.0..=1.0
    pub jitter: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl ExplainboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ExplainError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| ExplainError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Load ./explainbox.json, or the built-in defaults when it does not exist
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| ExplainError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            log::info!("{} not found, using built-in defaults", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }

        Self::load_from_file(config_path)
    }
}

impl ExecutionLimits {
    /// Convert sandbox config into runtime limits. Missing primary limits are a
    /// configuration error; run [`crate::config::validator::validate_config`] first
    /// to get the full list.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let missing = |name: &str| ExplainError::Config(format!("sandbox.{} is required", name));
        Ok(Self {
            timeout: Duration::from_millis(config.timeout_ms.ok_or_else(|| missing("timeout_ms"))?),
            memory_cap: config
                .memory_cap_bytes
                .ok_or_else(|| missing("memory_cap_bytes"))?,
            cpu_cap: Duration::from_millis(config.cpu_cap_ms.ok_or_else(|| missing("cpu_cap_ms"))?),
            max_output_bytes: config.max_output_bytes,
            max_file_size: config.max_file_size_bytes,
            max_open_files: config.max_open_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ExplainboxConfig =
            serde_json::from_str(r#"{"cache": {"max_entries": 5}}"#).unwrap();
        assert_eq!(config.cache.max_entries, 5);
        assert_eq!(config.cache.sweep_interval_secs, 300);
        assert_eq!(config.storage.durability, Durability::Durable);
    }

    #[test]
    fn test_in_memory_storage_has_no_paths() {
        let storage = StorageConfig {
            durability: Durability::InMemory,
            data_dir: PathBuf::from("/nonexistent"),
        };
        assert!(storage.cache_path().is_none());
        assert!(storage.history_path().is_none());
    }

    #[test]
    fn test_limits_require_timeout() {
        let mut sandbox = SandboxConfig::default();
        sandbox.timeout_ms = None;
        let err = ExecutionLimits::from_config(&sandbox).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_limits_from_default_config() {
        let limits = ExecutionLimits::from_config(&SandboxConfig::default()).unwrap();
        assert_eq!(limits.timeout, Duration::from_secs(5));
        assert_eq!(limits.cpu_cap, Duration::from_secs(3));
    }

    #[test]
    fn test_load_from_missing_file_is_config_error() {
        let err = ExplainboxConfig::load_from_file("/nonexistent/explainbox.json").unwrap_err();
        assert!(matches!(err, ExplainError::Config(_)));
    }
}
