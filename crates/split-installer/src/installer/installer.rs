use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};
use crate::extract::{ExtractOptions, NativeLibExtractor, SecondaryCodeExtractor};
use crate::integrity::{verify_content, SignatureVerifier};
use crate::lock::FileLock;
use crate::manifest::ModuleDescriptor;
use crate::paths::PathStore;
use crate::preprocess::BundledSource;
use crate::util::{remove_file_if_exists, retry};

/// What the host runtime needs to load an installed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub module_name: String,
    pub package_path: PathBuf,
    pub code_archives: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_lib_dir: Option<PathBuf>,
    pub first_installed: bool,
}

/// Per-module artifact pipeline run once a package is on disk.
#[derive(Clone)]
pub struct Installer {
    paths: PathStore,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    bundled: Option<Arc<dyn BundledSource>>,
    native_multi_archive: bool,
    max_attempts: u32,
    lock_timeout: Option<Duration>,
}

impl Installer {
    pub fn new(paths: PathStore) -> Self {
        Self {
            paths,
            verifier: None,
            bundled: None,
            native_multi_archive: false,
            max_attempts: 3,
            lock_timeout: None,
        }
    }

    /// Check packages with `verifier` before installing them.
    pub fn with_verifier(mut self, verifier: Option<Arc<dyn SignatureVerifier>>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_bundled(mut self, bundled: Option<Arc<dyn BundledSource>>) -> Self {
        self.bundled = bundled;
        self
    }

    /// The host loads every code archive straight from the package.
    pub fn with_native_multi_archive(mut self, enabled: bool) -> Self {
        self.native_multi_archive = enabled;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn paths(&self) -> &PathStore {
        &self.paths
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            max_attempts: self.max_attempts,
            lock_timeout: self.lock_timeout,
            force: false,
        }
    }

    /// Bundled path read in place, if the host ships this module that way.
    fn direct_package(&self, module: &ModuleDescriptor) -> Option<PathBuf> {
        if !module.built_in {
            return None;
        }
        self.bundled.as_ref().and_then(|b| b.direct_path(module))
    }

    fn locate_package(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        let path = self
            .direct_package(module)
            .unwrap_or_else(|| self.paths.package_path(module));

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            _ => Err(SplitError::ApkFileIllegal {
                module: module.name.clone(),
                path,
            }),
        }
    }

    /// Delete a corrupted package so the next attempt fetches it again.
    /// Packages read in place from the bundle are never touched.
    fn discard_package(&self, module: &ModuleDescriptor, package: &Path) {
        if self.direct_package(module).as_deref() == Some(package) {
            return;
        }
        if let Err(e) = remove_file_if_exists(package) {
            log::warn!("Failed to delete corrupted package {}: {}", package.display(), e);
        }
    }

    /// Install one module whose package is already on disk.
    pub fn install(&self, module: &ModuleDescriptor) -> Result<InstallResult> {
        let _lock = FileLock::acquire(self.paths.module_lock_file(&module.name)?, self.lock_timeout)?;
        let package = self.locate_package(module)?;

        if let Some(verifier) = &self.verifier {
            let trusted = match verifier.verify(&package) {
                Ok(trusted) => trusted,
                Err(e) => {
                    log::warn!("Could not read signature of {}: {}", module.name, e);
                    false
                }
            };
            if !trusted {
                self.discard_package(module, &package);
                return Err(SplitError::SignatureMismatch {
                    module: module.name.clone(),
                });
            }
        }

        if !verify_content(&package, &module.md5, module.size)? {
            log::warn!("Package of {} does not match the manifest, deleting it", module.name);
            self.discard_package(module, &package);
            return Err(SplitError::ChecksumMismatch {
                module: module.name.clone(),
            });
        }

        self.paths.oat_dir(module)?;

        let options = self.extract_options();
        let native_lib_dir = NativeLibExtractor::new(&self.paths, options.clone()).extract(module, &package)?;
        let code_archives = if self.native_multi_archive {
            Vec::new()
        } else {
            SecondaryCodeExtractor::new(&self.paths, options).extract(module, &package)?
        };

        let first_installed = self.create_marker(module)?;
        if first_installed {
            log::info!("Installed {} {}", module.name, module.version);
        } else {
            log::debug!("{} {} was already installed", module.name, module.version);
        }

        Ok(InstallResult {
            module_name: module.name.clone(),
            package_path: package,
            code_archives,
            native_lib_dir,
            first_installed,
        })
    }

    /// Create the installed marker. Returns `false` if it already existed.
    fn create_marker(&self, module: &ModuleDescriptor) -> Result<bool> {
        let what = format!("Creating installed marker for {}", module.name);
        retry(self.max_attempts, &what, |_| {
            let marker = self.paths.marker_file(module)?;
            match File::options().write(true).create_new(true).open(&marker) {
                Ok(file) => {
                    file.sync_all()?;
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .map_err(|e| SplitError::MarkCreateFailed {
            module: module.name.clone(),
            source: match e {
                SplitError::Io(io) => io,
                other => io::Error::other(other.to_string()),
            },
        })
    }

    /// Install every module, stopping at the first failure.
    pub fn install_all(&self, modules: &[ModuleDescriptor]) -> Result<Vec<InstallResult>> {
        modules.iter().map(|m| self.install(m)).collect()
    }

    /// Install every module, collecting failures instead of stopping.
    pub fn install_each(&self, modules: &[ModuleDescriptor]) -> (Vec<InstallResult>, Vec<(String, SplitError)>) {
        let mut installed = Vec::new();
        let mut failures = Vec::new();
        for module in modules {
            match self.install(module) {
                Ok(result) => installed.push(result),
                Err(e) => {
                    log::error!("Failed to install {}: {}", module.name, e);
                    failures.push((module.name.clone(), e));
                }
            }
        }
        (installed, failures)
    }

    /// Result for a module whose marker is already present.
    pub fn installed_result(&self, module: &ModuleDescriptor) -> Result<InstallResult> {
        let package = self.locate_package(module)?;
        let native_lib_dir = match &module.lib_info {
            Some(info) if module.has_native_libs() => Some(self.paths.native_lib_dir(module, &info.abi)?),
            _ => None,
        };
        let code_archives = if self.native_multi_archive {
            Vec::new()
        } else {
            SecondaryCodeExtractor::new(&self.paths, self.extract_options()).existing(module)?
        };

        Ok(InstallResult {
            module_name: module.name.clone(),
            package_path: package,
            code_archives,
            native_lib_dir,
            first_installed: false,
        })
    }
}
