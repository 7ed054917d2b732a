pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "PROVFLOW_CONFIG_PATH";

/// How failed steps are resolved when nobody is asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Prompt the operator on the terminal
    #[default]
    Ask,
    /// Retry automatically up to `max_retries` times
    Retry,
    /// Skip the failed step
    Skip,
    /// Abort and roll back what was created
    Cleanup,
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fail_mode: FailMode,

    /// Automatic retries per step before the step counts as exhausted
    pub max_retries: u32,

    /// Pause before an automatic retry
    pub retry_wait_secs: u64,

    /// Polling interval of workload and image drains
    pub poll_interval_ms: u64,

    /// Drain timeout used when a failed deployment is rolled back
    pub delete_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Ask,
            max_retries: 3,
            retry_wait_secs: 2,
            poll_interval_ms: 1000,
            delete_timeout_secs: 60,
        }
    }
}

impl Settings {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    /// Parses a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Loads the first settings file found, or the defaults when there is none
    pub fn discover() -> Result<Self> {
        match find_settings_file() {
            Ok(path) => {
                tracing::debug!("Loading settings from {}", path.display());
                Self::load(&path)
            }
            Err(ConfigError::SettingsFileNotFound) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

/// Returns the provflow configuration directory, creating it on first use
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("provflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locates the settings file
///
/// Search order:
/// 1. `PROVFLOW_CONFIG_PATH` (direct path)
/// 2. current directory: provflow.local.yaml, provflow.yaml
/// 3. ~/.config/provflow/config.yaml
pub fn find_settings_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in ["provflow.local.yaml", "provflow.yaml"] {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("provflow").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::SettingsFileNotFound)
}
