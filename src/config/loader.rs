use super::{get_config_dir, EngineConfig};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Name of the configuration file looked up in the user config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Loads `EngineConfig` from disk and applies environment overrides
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    apply_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            apply_env: true,
        }
    }

    /// Load from this file instead of the user config directory. A missing
    /// explicit file is an error; a missing default file is not.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Skip `STRATA_*` environment overrides
    pub fn without_env(mut self) -> Self {
        self.apply_env = false;
        self
    }

    pub async fn load(&self) -> Result<EngineConfig> {
        let mut config = match &self.explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("Configuration file not found: {}", path.display()));
                }
                Self::read_file(path).await?
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::read_file(&path).await?,
                _ => {
                    debug!("No configuration file found, using defaults");
                    EngineConfig::default()
                }
            },
        };

        if self.apply_env {
            config.merge_env_vars();
        }

        Ok(config)
    }

    async fn read_file(path: &Path) -> Result<EngineConfig> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        get_config_dir().ok().map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
