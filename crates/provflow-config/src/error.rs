use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "Settings file not found. Looked in:\n\
        - PROVFLOW_CONFIG_PATH\n\
        - current directory: provflow.local.yaml, provflow.yaml\n\
        - ~/.config/provflow/config.yaml"
    )]
    SettingsFileNotFound,

    #[error("Invalid settings file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
