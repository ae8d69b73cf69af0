//! Error types for skein configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error while reading a config file.
    #[error("IO error reading {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    /// TOML parse error.
    #[error("Parse error in {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A value parsed but is not usable.
    #[error("Invalid config value for '{key}': {message}")]
    Invalid { key: String, message: String },
}
