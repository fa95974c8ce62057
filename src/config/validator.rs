// Startup config validation
// Missing or zero primary limits are fatal; everything else is a warning.

use crate::config::config::ExplainboxConfig;
use crate::config::types::{ExplainError, Result};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at startup.
///
/// Returns `Err(ExplainError::Config)` listing every error when the config is
/// unusable; otherwise the result carries warnings for the caller to log.
pub fn validate_config(config: &ExplainboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_cache(config, &mut result);
    validate_provider(config, &mut result);

    if !result.is_valid() {
        return Err(ExplainError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    Ok(result)
}

fn validate_limits(config: &ExplainboxConfig, result: &mut ValidationResult) {
    let sandbox = &config.sandbox;

    match sandbox.timeout_ms {
        None => result.add_error("sandbox.timeout_ms is required".to_string()),
        Some(0) => result.add_error("sandbox.timeout_ms cannot be zero".to_string()),
        Some(_) => {}
    }

    match sandbox.memory_cap_bytes {
        None => result.add_error("sandbox.memory_cap_bytes is required".to_string()),
        Some(0) => result.add_error("sandbox.memory_cap_bytes cannot be zero".to_string()),
        Some(bytes) if bytes < 32 * 1024 * 1024 => result.add_warning(format!(
            "sandbox.memory_cap_bytes {} is very low (< 32MB), the interpreter may not start",
            bytes
        )),
        Some(_) => {}
    }

    match sandbox.cpu_cap_ms {
        None => result.add_error("sandbox.cpu_cap_ms is required".to_string()),
        Some(0) => result.add_error("sandbox.cpu_cap_ms cannot be zero".to_string()),
        Some(_) => {}
    }

    if let (Some(cpu), Some(wall)) = (sandbox.cpu_cap_ms, sandbox.timeout_ms) {
        if wall < cpu {
            result.add_warning(format!(
                "sandbox.timeout_ms ({}) is below sandbox.cpu_cap_ms ({}), the CPU cap can never trigger",
                wall, cpu
            ));
        }
    }

    if sandbox.max_output_bytes == 0 {
        result.add_error("sandbox.max_output_bytes cannot be zero".to_string());
    }
    if sandbox.max_open_files < 8 {
        result.add_warning(format!(
            "sandbox.max_open_files {} is very low, the interpreter may fail to import",
            sandbox.max_open_files
        ));
    }
}

fn validate_paths(config: &ExplainboxConfig, result: &mut ValidationResult) {
    let sandbox = &config.sandbox;

    if !sandbox.interpreter.is_absolute() {
        result.add_error(format!(
            "sandbox.interpreter must be an absolute path: {:?}",
            sandbox.interpreter
        ));
    } else if !sandbox.interpreter.exists() {
        result.add_warning(format!(
            "sandbox.interpreter does not exist: {:?}",
            sandbox.interpreter
        ));
    }

    if !sandbox.scratch_root.is_absolute() {
        result.add_error(format!(
            "sandbox.scratch_root must be an absolute path: {:?}",
            sandbox.scratch_root
        ));
    }

    for path in &sandbox.read_only_paths {
        if !path.is_absolute() {
            result.add_error(format!(
                "sandbox.read_only_paths entries must be absolute: {:?}",
                path
            ));
        } else if !path.exists() {
            result.add_warning(format!("read-only path does not exist: {:?}", path));
        }
    }

    if !config.storage.data_dir.is_absolute() {
        result.add_error(format!(
            "storage.data_dir must be an absolute path: {:?}",
            config.storage.data_dir
        ));
    }
}

fn validate_cache(config: &ExplainboxConfig, result: &mut ValidationResult) {
    if config.cache.max_entries == 0 {
        result.add_error("cache.max_entries cannot be zero".to_string());
    }
    if config.cache.sweep_interval_secs == 0 {
        result.add_warning("cache.sweep_interval_secs is zero, background sweeps disabled".to_string());
    }
    if config.history.top_k == 0 {
        result.add_warning("history.top_k is zero, statistics will list no signatures".to_string());
    }
    if config.history.retention_days == 0 {
        result.add_warning("history.retention_days is zero, retention sweeps disabled".to_string());
    }
}

fn validate_provider(config: &ExplainboxConfig, result: &mut ValidationResult) {
    let provider = &config.provider;
    if provider.max_attempts == 0 {
        result.add_error("provider.max_attempts must be at least 1".to_string());
    }
    if !(0.0..=1.0).contains(&provider.jitter) {
        result.add_error(format!(
            "provider.jitter must be within 0.0..=1.0, got {}",
            provider.jitter
        ));
    }
    if provider.max_delay_ms < provider.base_delay_ms {
        result.add_warning(format!(
            "provider.max_delay_ms ({}) is below provider.base_delay_ms ({})",
            provider.max_delay_ms, provider.base_delay_ms
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&ExplainboxConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_missing_limit_is_fatal() {
        let mut config = ExplainboxConfig::default();
        config.sandbox.memory_cap_bytes = None;
        config.sandbox.cpu_cap_ms = Some(0);

        let err = validate_config(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("memory_cap_bytes is required"));
        assert!(msg.contains("cpu_cap_ms cannot be zero"));
    }

    #[test]
    fn test_low_cpu_vs_wall_is_warning() {
        let mut config = ExplainboxConfig::default();
        config.sandbox.timeout_ms = Some(100);
        config.sandbox.cpu_cap_ms = Some(1_000);

        let result = validate_config(&config).unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("CPU cap can never trigger")));
    }

    #[test]
    fn test_relative_scratch_root_rejected() {
        let mut config = ExplainboxConfig::default();
        config.sandbox.scratch_root = "scratch".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_jitter_out_of_range_rejected() {
        let mut config = ExplainboxConfig::default();
        config.provider.jitter = 1.5;
        assert!(validate_config(&config).is_err());
    }
}
