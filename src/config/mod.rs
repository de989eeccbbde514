//! Engine configuration
//!
//! `EngineConfig` is read from a TOML file and then overlaid with `STRATA_*`
//! environment variables. Parameter defaults configured here form the
//! "environment/config" tier of parameter resolution.

use crate::redact::Redactor;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub mod loader;

pub use loader::ConfigLoader;

/// Prefix for environment variables that provide parameter defaults
pub const PARAM_ENV_PREFIX: &str = "STRATA_PARAM_";

/// Get the directory holding the user-level configuration file
pub fn get_config_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "strata", "strata")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory scanned for strategy definitions
    pub strategies_dir: PathBuf,
    /// Directory where chunk checkpoints are written
    pub checkpoint_dir: PathBuf,
    /// Upper bound on jobs running at the same time
    pub max_concurrent_jobs: usize,
    /// Upper bound on blocking tasks delegated by actions
    pub blocking_pool_size: usize,
    /// Timeout applied to steps that do not declare one
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Option<Duration>,
    /// Timeout applied to whole jobs unless the request overrides it
    #[serde(with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
    pub log_level: Option<String>,
    /// Environment variables whose values must never appear in logs or audit entries
    pub secret_env_keys: Vec<String>,
    /// Parameter defaults used when neither the request nor the strategy supplies a value
    pub parameter_defaults: Map<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategies_dir: PathBuf::from("strategies"),
            checkpoint_dir: PathBuf::from(".strata/checkpoints"),
            max_concurrent_jobs: 4,
            blocking_pool_size: 8,
            default_step_timeout: None,
            job_timeout: None,
            log_level: Some("info".to_string()),
            secret_env_keys: Vec::new(),
            parameter_defaults: Map::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `STRATA_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) {
        let env: HashMap<String, String> = std::env::vars().collect();
        self.merge_env(&env);
    }

    /// Apply `STRATA_*` overrides from an explicit variable map
    pub fn merge_env(&mut self, env: &HashMap<String, String>) {
        if let Some(level) = env.get("STRATA_LOG_LEVEL") {
            self.log_level = Some(level.clone());
        }

        if let Some(dir) = env.get("STRATA_STRATEGIES_DIR") {
            self.strategies_dir = PathBuf::from(dir);
        }

        if let Some(dir) = env.get("STRATA_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(dir);
        }

        if let Some(jobs) = env.get("STRATA_MAX_CONCURRENT_JOBS") {
            if let Ok(value) = jobs.parse::<usize>() {
                self.max_concurrent_jobs = value.max(1);
            }
        }

        if let Some(timeout) = env.get("STRATA_JOB_TIMEOUT") {
            if let Ok(value) = humantime_serde::re::humantime::parse_duration(timeout) {
                self.job_timeout = Some(value);
            }
        }

        for (key, raw) in env {
            if let Some(name) = key.strip_prefix(PARAM_ENV_PREFIX) {
                if name.is_empty() {
                    continue;
                }
                self.parameter_defaults
                    .insert(name.to_lowercase(), parse_env_value(raw));
            }
        }
    }

    /// Build the redactor for the configured secret keys
    pub fn redactor(&self) -> Redactor {
        let env: HashMap<String, String> = std::env::vars().collect();
        Redactor::from_env_keys(&self.secret_env_keys, &env)
    }
}

/// Env values are JSON when they parse as JSON scalars, strings otherwise
fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => value,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.strategies_dir, PathBuf::from("strategies"));
        assert!(config.job_timeout.is_none());
        assert!(config.parameter_defaults.is_empty());
    }

    #[test]
    fn test_merge_env_overrides_fields() {
        let mut config = EngineConfig::default();
        let mut env = HashMap::new();
        env.insert("STRATA_LOG_LEVEL".to_string(), "debug".to_string());
        env.insert("STRATA_MAX_CONCURRENT_JOBS".to_string(), "16".to_string());
        env.insert("STRATA_JOB_TIMEOUT".to_string(), "90s".to_string());
        env.insert("STRATA_CHECKPOINT_DIR".to_string(), "/var/strata".to_string());

        config.merge_env(&env);

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.max_concurrent_jobs, 16);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.checkpoint_dir, PathBuf::from("/var/strata"));
    }

    #[test]
    fn test_merge_env_collects_parameter_defaults() {
        let mut config = EngineConfig::default();
        config
            .parameter_defaults
            .insert("threshold".to_string(), json!(0.5));

        let mut env = HashMap::new();
        env.insert("STRATA_PARAM_THRESHOLD".to_string(), "0.95".to_string());
        env.insert("STRATA_PARAM_OUTPUT_DIR".to_string(), "/data/out".to_string());
        env.insert("STRATA_PARAM_".to_string(), "ignored".to_string());
        config.merge_env(&env);

        assert_eq!(config.parameter_defaults["threshold"], json!(0.95));
        assert_eq!(config.parameter_defaults["output_dir"], json!("/data/out"));
        assert_eq!(config.parameter_defaults.len(), 2);
    }

    #[test]
    fn test_invalid_numeric_env_is_ignored() {
        let mut config = EngineConfig::default();
        let mut env = HashMap::new();
        env.insert("STRATA_MAX_CONCURRENT_JOBS".to_string(), "many".to_string());
        config.merge_env(&env);
        assert_eq!(config.max_concurrent_jobs, 4);
    }
}
