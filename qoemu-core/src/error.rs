use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config option {option}: {reason}")]
    Invalid { option: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(option: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
