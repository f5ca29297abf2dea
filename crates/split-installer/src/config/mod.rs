//! Installer configuration.
//!
//! # Sources (in priority order, highest to lowest)
//!
//! 1. Environment variables (`SPLIT_*`)
//! 2. `split-config.json` (or an explicit file)
//! 3. Built-in defaults

mod config;
mod source;

pub use config::InstallConfig;
pub use source::{ConfigLoader, ConfigSource, RawConfig, CONFIG_FILE_NAME};
