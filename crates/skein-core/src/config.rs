//! Configuration types.
//!
//! The runtime reads `config.toml` from the skein config directory. Every
//! section is optional; a missing file yields the defaults.
//!
//! ```toml
//! [plugins]
//! dir = "/home/me/.config/skein/plugins"
//!
//! [workers]
//! thread_name = "pagemodel"
//! stack_size = 1048576
//!
//! [tree]
//! event_capacity = 256
//!
//! [logging]
//! filter = "info,skein_plugin_api=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Runtime configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Plugin discovery.
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Page model worker threads.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Property tree settings.
    #[serde(default)]
    pub tree: TreeConfig,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where plugins are loaded from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Directory scanned for `*.lua` modules. Defaults to `<config dir>/plugins`.
    pub dir: Option<PathBuf>,
}

/// Worker thread settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Name prefix given to every page model worker thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Stack size in bytes. Uses the platform default when unset.
    #[serde(default)]
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            stack_size: None,
        }
    }
}

fn default_thread_name() -> String {
    "pagemodel".to_string()
}

/// Property tree settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeConfig {
    /// Capacity of the tree-event broadcast channel seen by observers.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize {
    256
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Load `config.toml` from the config directory, or defaults if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tree.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "tree.event_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.workers.thread_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "workers.thread_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// The plugin directory: the configured one, else `<config dir>/plugins`.
    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.plugins
            .dir
            .clone()
            .or_else(|| config_dir().map(|p| p.join("plugins")))
    }
}

/// Get the config directory path.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("skein"))
}

/// Get the path to `config.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}
