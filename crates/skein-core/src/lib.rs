//! Core types for the skein plugin page runtime.
//!
//! This crate contains shared data structures used across the skein crates:
//! - Runtime configuration (plugins, workers, tree, logging)
//! - Configuration errors

mod config;
mod error;

pub use config::{
    config_dir, config_path, LoggingConfig, PluginConfig, RuntimeConfig, TreeConfig,
    WorkerConfig,
};
pub use error::ConfigError;
