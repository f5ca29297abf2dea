use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::source::{ConfigLoader, ConfigSource, RawConfig, CONFIG_FILE_NAME};
use crate::error::{Result, SplitError};
use crate::manifest::DeviceProfile;

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_process_name() -> String {
    "main".to_string()
}

fn default_metered_threshold() -> i64 {
    -1
}

/// Settings for the installer and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallConfig {
    /// Root of the module layout.
    pub root_dir: PathBuf,

    #[serde(default = "default_true")]
    pub verify_signature: bool,

    /// SHA-256 digests (hex) of the host's signing certificates.
    #[serde(default)]
    pub host_certificates: Vec<String>,

    /// The host can load every code archive straight from a package.
    #[serde(default)]
    pub native_multi_archive: bool,

    /// Attempts for transient I/O operations.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bounded wait for cross-process locks. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,

    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Whether this process promotes pending manifest versions.
    #[serde(default = "default_true")]
    pub main_process: bool,

    #[serde(default)]
    pub device: DeviceProfile,

    /// Directory holding packages shipped with the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled_dir: Option<PathBuf>,

    /// Bytes above which a download on a metered network needs the user's
    /// confirmation. Negative means never.
    #[serde(default = "default_metered_threshold")]
    pub metered_threshold: i64,

    #[serde(skip)]
    sources: HashMap<String, ConfigSource>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root_dir: ConfigLoader::new(false).default_root_dir(),
            verify_signature: true,
            host_certificates: Vec::new(),
            native_multi_archive: false,
            max_attempts: default_max_attempts(),
            lock_timeout_ms: None,
            process_name: default_process_name(),
            main_process: true,
            device: DeviceProfile::default(),
            bundled_dir: None,
            metered_threshold: default_metered_threshold(),
            sources: HashMap::new(),
        }
    }
}

const CONFIG_KEYS: &[&str] = &[
    "root-dir",
    "verify-signature",
    "host-certificates",
    "native-multi-archive",
    "max-attempts",
    "lock-timeout-ms",
    "process-name",
    "main-process",
    "device",
    "bundled-dir",
    "metered-threshold",
];

impl InstallConfig {
    /// Configuration rooted at `root_dir`, everything else defaulted.
    pub fn with_root_dir<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Build configuration from defaults, a config file and the environment.
    ///
    /// Without an explicit `config_file`, `split-config.json` in the current
    /// directory is used if present.
    pub fn build<P: AsRef<Path>>(config_file: Option<P>, use_environment: bool) -> Result<Self> {
        let loader = ConfigLoader::new(use_environment);
        let mut config = Self {
            root_dir: loader.default_root_dir(),
            ..Self::default()
        };

        for key in CONFIG_KEYS {
            config.sources.insert(key.to_string(), ConfigSource::Default);
        }

        let file = match &config_file {
            Some(path) => path.as_ref().to_path_buf(),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };
        if config_file.is_some() && !file.exists() {
            return Err(SplitError::Config(format!("{} does not exist", file.display())));
        }
        let raw = loader.load_config_file(&file)?;
        config.merge_raw_config(raw, ConfigSource::File(file))?;

        if use_environment {
            config.apply_env_overrides(&loader)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Where the value of `key` came from.
    pub fn get_source(&self, key: &str) -> Option<&ConfigSource> {
        self.sources.get(key)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SplitError::Config("max-attempts must be at least 1".to_string()));
        }
        if self.process_name.trim().is_empty() {
            return Err(SplitError::Config("process-name must not be empty".to_string()));
        }
        Ok(())
    }

    fn merge_raw_config(&mut self, raw: RawConfig, source: ConfigSource) -> Result<()> {
        for (key, value) in raw.values {
            self.merge_config_value(&key, value, source.clone())?;
        }
        Ok(())
    }

    fn merge_config_value(&mut self, key: &str, value: serde_json::Value, source: ConfigSource) -> Result<()> {
        let invalid = || SplitError::Config(format!("Invalid value for {} in {}", key, source.describe()));

        match key {
            "root-dir" => {
                self.root_dir = PathBuf::from(value.as_str().ok_or_else(invalid)?);
            }
            "verify-signature" => {
                self.verify_signature = value.as_bool().ok_or_else(invalid)?;
            }
            "host-certificates" => {
                self.host_certificates = serde_json::from_value(value).map_err(|_| invalid())?;
            }
            "native-multi-archive" => {
                self.native_multi_archive = value.as_bool().ok_or_else(invalid)?;
            }
            "max-attempts" => {
                let n = value.as_u64().ok_or_else(invalid)?;
                self.max_attempts = u32::try_from(n).map_err(|_| invalid())?;
            }
            "lock-timeout-ms" => {
                self.lock_timeout_ms = match value {
                    serde_json::Value::Null => None,
                    other => Some(other.as_u64().ok_or_else(invalid)?),
                };
            }
            "process-name" => {
                self.process_name = value.as_str().ok_or_else(invalid)?.to_string();
            }
            "main-process" => {
                self.main_process = value.as_bool().ok_or_else(invalid)?;
            }
            "device" => {
                self.device = serde_json::from_value(value).map_err(|_| invalid())?;
            }
            "bundled-dir" => {
                self.bundled_dir = value.as_str().map(PathBuf::from);
            }
            "metered-threshold" => {
                self.metered_threshold = value.as_i64().ok_or_else(invalid)?;
            }
            _ => {
                log::warn!("Ignoring unknown config key {} in {}", key, source.describe());
                return Ok(());
            }
        }

        self.sources.insert(key.to_string(), source);
        Ok(())
    }

    fn apply_env_overrides(&mut self, loader: &ConfigLoader) -> Result<()> {
        let env_source = |key: &str| ConfigSource::Environment(ConfigLoader::env_var_name(key));

        if let Some(root_dir) = loader.get_env_path("root-dir") {
            self.root_dir = root_dir;
            self.sources.insert("root-dir".to_string(), env_source("root-dir"));
        }

        if let Some(verify) = loader.get_env_bool("verify-signature") {
            self.verify_signature = verify;
            self.sources.insert("verify-signature".to_string(), env_source("verify-signature"));
        }

        if let Some(raw) = loader.get_env_config("lock-timeout-ms") {
            let ms = raw
                .parse()
                .map_err(|_| SplitError::Config(format!("Invalid SPLIT_LOCK_TIMEOUT_MS: {}", raw)))?;
            self.lock_timeout_ms = Some(ms);
            self.sources.insert("lock-timeout-ms".to_string(), env_source("lock-timeout-ms"));
        }

        if let Some(attempts) = loader.get_env_u64("max-attempts") {
            self.max_attempts = u32::try_from(attempts)
                .map_err(|_| SplitError::Config(format!("Invalid SPLIT_MAX_ATTEMPTS: {}", attempts)))?;
            self.sources.insert("max-attempts".to_string(), env_source("max-attempts"));
        }

        if let Some(bundled_dir) = loader.get_env_path("bundled-dir") {
            self.bundled_dir = Some(bundled_dir);
            self.sources.insert("bundled-dir".to_string(), env_source("bundled-dir"));
        }

        Ok(())
    }
}
