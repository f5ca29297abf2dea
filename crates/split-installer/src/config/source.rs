use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SplitError};

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "split-config.json";

const ENV_PREFIX: &str = "SPLIT_";

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in default
    Default,
    /// From a `split-config.json` file
    File(PathBuf),
    /// From an environment variable
    Environment(String),
}

impl ConfigSource {
    pub fn describe(&self) -> String {
        match self {
            ConfigSource::Default => "default".to_string(),
            ConfigSource::File(path) => path.display().to_string(),
            ConfigSource::Environment(var) => var.clone(),
        }
    }
}

/// Untyped key/value pairs read from a config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(flatten)]
    pub values: HashMap<String, serde_json::Value>,
}

/// Reads configuration files and `SPLIT_*` environment variables
#[derive(Debug)]
pub struct ConfigLoader {
    use_environment: bool,
}

impl ConfigLoader {
    pub fn new(use_environment: bool) -> Self {
        Self { use_environment }
    }

    pub fn uses_environment(&self) -> bool {
        self.use_environment
    }

    /// Default root of the module layout
    pub fn default_root_dir(&self) -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "split-installer") {
            proj_dirs.data_dir().join("splits")
        } else if let Some(base) = directories::BaseDirs::new() {
            base.home_dir().join(".split-installer").join("splits")
        } else {
            PathBuf::from("splits")
        }
    }

    /// Load a config file. A missing file reads as empty.
    pub fn load_config_file<P: AsRef<Path>>(&self, path: P) -> Result<RawConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(RawConfig::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| SplitError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| SplitError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Environment variable name for a config key: `lock-timeout-ms` is
    /// `SPLIT_LOCK_TIMEOUT_MS`.
    pub fn env_var_name(key: &str) -> String {
        format!("{}{}", ENV_PREFIX, key.replace('-', "_").to_uppercase())
    }

    pub fn get_env_config(&self, key: &str) -> Option<String> {
        if !self.use_environment {
            return None;
        }
        env::var(Self::env_var_name(key)).ok().filter(|s| !s.is_empty())
    }

    pub fn get_env_bool(&self, key: &str) -> Option<bool> {
        self.get_env_config(key)
            .map(|val| !matches!(val.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
    }

    pub fn get_env_u64(&self, key: &str) -> Option<u64> {
        self.get_env_config(key).and_then(|val| val.parse().ok())
    }

    pub fn get_env_path(&self, key: &str) -> Option<PathBuf> {
        self.get_env_config(key).map(PathBuf::from)
    }
}
