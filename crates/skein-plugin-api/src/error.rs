//! Error types for the plugin API.
//!
//! Registration errors are reported synchronously and never leave partial
//! state behind. Errors are convertible to `mlua::Error` so they surface as
//! ordinary Lua errors inside plugin callbacks.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for plugin API operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The route pattern is not a valid regular expression.
    #[error("Invalid regular expression '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The anchored pattern is already routed.
    #[error("URL already routed: '{0}'")]
    DuplicatePattern(String),

    /// A handler or paginator was not callable.
    #[error("Argument is not a function (got {got})")]
    NotAFunction { got: &'static str },

    /// No module with the given name is loaded.
    #[error("Module '{0}' not found")]
    ModuleNotFound(String),

    /// Lua runtime error.
    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),

    /// Reading a plugin file or directory failed.
    #[error("Failed to read '{path}': {message}")]
    Io { path: PathBuf, message: String },

    /// The OS refused to start a worker thread.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),
}

impl From<PluginError> for mlua::Error {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Lua(inner) => inner,
            other => mlua::Error::RuntimeError(other.to_string()),
        }
    }
}

/// Result type alias for plugin API operations.
pub type PluginResult<T> = Result<T, PluginError>;
