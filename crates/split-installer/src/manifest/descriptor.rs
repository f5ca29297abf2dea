//! Module descriptors and the manifest document that lists them.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};
use crate::paths::{is_single_component, RESERVED_NAMES};

fn path_component_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.@+\-]*$").unwrap())
}

/// Names that end up as one directory or file name under the root.
fn is_path_component(name: &str) -> bool {
    path_component_regex().is_match(name) && is_single_component(name)
}

fn md5_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{32}$").unwrap())
}

fn default_dex_number() -> u32 {
    1
}

/// Device characteristics that decide whether a module can run here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceProfile {
    /// OS API level of the device.
    pub os_version: u32,
    /// Supported ABIs, most preferred first.
    pub abis: Vec<String>,
}

impl DeviceProfile {
    pub fn new(os_version: u32, abis: Vec<String>) -> Self {
        Self { os_version, abis }
    }

    pub fn supports_abi(&self, abi: &str) -> bool {
        self.abis.iter().any(|a| a == abi)
    }
}

/// One native library shipped inside a module package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibDescriptor {
    pub name: String,
    pub md5: String,
    #[serde(default)]
    pub size: u64,
}

/// Native libraries of a module, built for one ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibInfo {
    pub abi: String,
    #[serde(default)]
    pub libs: Vec<LibDescriptor>,
}

/// Immutable description of one installable module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    #[serde(rename = "splitName")]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub url: String,
    pub md5: String,
    pub size: u64,
    #[serde(default)]
    pub built_in: bool,
    #[serde(default)]
    pub min_sdk_version: u32,
    #[serde(default = "default_dex_number")]
    pub dex_number: u32,
    #[serde(default)]
    pub work_processes: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lib_info: Option<LibInfo>,
}

impl ModuleDescriptor {
    /// Create a descriptor with the required fields, everything else defaulted.
    pub fn new(name: impl Into<String>, version: impl Into<String>, md5: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            url: String::new(),
            md5: md5.into(),
            size,
            built_in: false,
            min_sdk_version: 0,
            dex_number: 1,
            work_processes: Vec::new(),
            dependencies: Vec::new(),
            lib_info: None,
        }
    }

    /// Whether the module declares native libraries.
    pub fn has_native_libs(&self) -> bool {
        self.lib_info.as_ref().is_some_and(|info| !info.libs.is_empty())
    }

    /// Number of code archives beyond the primary one.
    pub fn secondary_archive_count(&self) -> u32 {
        self.dex_number.saturating_sub(1)
    }

    /// Whether the device can run this module.
    pub fn is_compatible(&self, device: &DeviceProfile) -> bool {
        if device.os_version < self.min_sdk_version {
            return false;
        }
        match &self.lib_info {
            Some(info) if !info.libs.is_empty() => device.supports_abi(&info.abi),
            _ => true,
        }
    }

    /// Whether the module is meant to be loaded in `process`.
    ///
    /// An empty process list means every process.
    pub fn runs_in(&self, process: &str) -> bool {
        self.work_processes.is_empty() || self.work_processes.iter().any(|p| p == process)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !is_path_component(&self.name) {
            return Err(format!("invalid module name '{}'", self.name));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(format!("module name '{}' is reserved", self.name));
        }
        if !is_path_component(&self.version) {
            return Err(format!("{}: invalid version '{}'", self.name, self.version));
        }
        if !md5_regex().is_match(&self.md5) {
            return Err(format!("{}: md5 must be 32 hex characters", self.name));
        }
        if self.size == 0 {
            return Err(format!("{}: size must be positive", self.name));
        }
        if !self.built_in {
            url::Url::parse(&self.url)
                .map_err(|e| format!("{}: invalid url '{}': {}", self.name, self.url, e))?;
        }
        if self.dex_number == 0 {
            return Err(format!("{}: dexNumber must be at least 1", self.name));
        }
        if let Some(info) = &self.lib_info {
            if !info.libs.is_empty() && info.abi.trim().is_empty() {
                return Err(format!("{}: libInfo declares libraries without an ABI", self.name));
            }
            if !info.abi.is_empty() && !is_path_component(&info.abi) {
                return Err(format!("{}: invalid ABI '{}'", self.name, info.abi));
            }
            for lib in &info.libs {
                if !is_path_component(&lib.name) {
                    return Err(format!("{}: invalid library name '{}'", self.name, lib.name));
                }
                if !md5_regex().is_match(&lib.md5) {
                    return Err(format!("{}: library {} has no valid md5", self.name, lib.name));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    qigsaw_id: String,
    #[serde(default)]
    app_version_name: String,
    #[serde(default)]
    splits: Vec<ModuleDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    update_splits: Vec<String>,
}

/// The versioned metadata document describing every module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest", into = "RawManifest")]
pub struct Manifest {
    id: String,
    app_version_name: String,
    modules: IndexMap<String, ModuleDescriptor>,
    update_splits: Vec<String>,
}

impl TryFrom<RawManifest> for Manifest {
    type Error = String;

    fn try_from(raw: RawManifest) -> std::result::Result<Self, Self::Error> {
        let mut modules = IndexMap::with_capacity(raw.splits.len());
        for split in raw.splits {
            let name = split.name.clone();
            if modules.insert(name.clone(), split).is_some() {
                return Err(format!("duplicate module '{}'", name));
            }
        }
        Ok(Self {
            id: raw.qigsaw_id,
            app_version_name: raw.app_version_name,
            modules,
            update_splits: raw.update_splits,
        })
    }
}

impl From<Manifest> for RawManifest {
    fn from(manifest: Manifest) -> Self {
        Self {
            qigsaw_id: manifest.id,
            app_version_name: manifest.app_version_name,
            splits: manifest.modules.into_values().collect(),
            update_splits: manifest.update_splits,
        }
    }
}

impl Manifest {
    pub fn new(id: impl Into<String>, app_version_name: impl Into<String>, modules: Vec<ModuleDescriptor>) -> Self {
        Self {
            id: id.into(),
            app_version_name: app_version_name.into(),
            modules: modules.into_iter().map(|m| (m.name.clone(), m)).collect(),
            update_splits: Vec::new(),
        }
    }

    /// Parse and validate a manifest from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| SplitError::InvalidManifest {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Identity of this manifest; qualifies every on-disk path.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_version_name(&self) -> &str {
        &self.app_version_name
    }

    pub fn update_splits(&self) -> &[String] {
        &self.update_splits
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if !is_path_component(&self.id) {
            return Err(SplitError::InvalidManifest {
                message: format!("invalid manifest id '{}'", self.id),
            });
        }
        for module in self.modules.values() {
            module
                .validate()
                .map_err(|message| SplitError::InvalidManifest { message })?;
        }
        for name in &self.update_splits {
            if !self.modules.contains_key(name) {
                return Err(SplitError::InvalidManifest {
                    message: format!("updateSplits names unknown module '{}'", name),
                });
            }
        }
        Ok(())
    }

    /// Declared dependencies of `requested` that are neither part of the
    /// request nor already installed.
    pub fn missing_dependencies<F>(&self, requested: &[&ModuleDescriptor], is_installed: F) -> Vec<String>
    where
        F: Fn(&ModuleDescriptor) -> bool,
    {
        let requested_names: HashSet<&str> = requested.iter().map(|m| m.name.as_str()).collect();
        let mut missing = Vec::new();

        for module in requested {
            for dep in &module.dependencies {
                if requested_names.contains(dep.as_str()) || missing.contains(dep) {
                    continue;
                }
                let installed = self.get(dep).is_some_and(|d| is_installed(d));
                if !installed {
                    missing.push(dep.clone());
                }
            }
        }

        missing
    }
}
