//! Versioned on-disk layout of installed modules.
//!
//! ```text
//! <root>/<manifestId>/locks/<module>.lock
//! <root>/<manifestId>/<module>/<version>/<md5>            installed marker
//! <root>/<manifestId>/<module>/<version>/<module>.pkg     package
//! <root>/<manifestId>/<module>/<version>/oat/
//! <root>/<manifestId>/<module>/<version>/nativeLib/<abi>/
//! <root>/<manifestId>/<module>/<version>/code_cache/
//! <root>/<manifestId>/uninstall/uninstallsplits.info
//! <root>/<manifestId>/temp/
//! <root>/manifest_version/
//! ```

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::error::{Result, SplitError};
use crate::lock::FileLock;
use crate::manifest::{Manifest, ModuleDescriptor};
use crate::util::remove_dir_if_exists;

pub const UNINSTALL_DIR: &str = "uninstall";
pub const TEMP_DIR: &str = "temp";
pub const LOCKS_DIR: &str = "locks";
pub const MANIFEST_VERSION_DIR: &str = "manifest_version";

/// Directory names that can never be module names.
pub const RESERVED_NAMES: &[&str] = &[UNINSTALL_DIR, TEMP_DIR, LOCKS_DIR, MANIFEST_VERSION_DIR];

const LOCK_EXTENSION: &str = "lock";
const PACKAGE_EXTENSION: &str = "pkg";

/// Whether `name` is exactly one normal path component (no `.`, `..`,
/// separators or roots).
pub fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == name
    )
}

/// Paths removed by [`PathStore::clear_cache`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheReport {
    pub removed: Vec<PathBuf>,
    pub freed_bytes: u64,
}

impl CacheReport {
    fn remove(&mut self, path: PathBuf) -> io::Result<()> {
        self.freed_bytes += disk_usage(&path);
        remove_dir_if_exists(&path)?;
        self.removed.push(path);
        Ok(())
    }
}

fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Maps (module, version, manifest id) to directories under one root.
#[derive(Debug, Clone)]
pub struct PathStore {
    root: PathBuf,
    manifest_id: String,
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&path)?;
    Ok(path)
}

impl PathStore {
    pub fn new(root: impl Into<PathBuf>, manifest_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manifest_id: manifest_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_id(&self) -> &str {
        &self.manifest_id
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest_id)
    }

    fn module_path(&self, name: &str) -> PathBuf {
        self.manifest_path().join(name)
    }

    fn version_path(&self, module: &ModuleDescriptor) -> PathBuf {
        self.module_path(&module.name).join(&module.version)
    }

    /// `<root>/<manifestId>`, created on demand.
    pub fn manifest_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.manifest_path())
    }

    /// `<root>/<manifestId>/<module>`, created on demand.
    pub fn module_dir(&self, name: &str) -> Result<PathBuf> {
        ensure_dir(self.module_path(name))
    }

    /// Versioned root of a module, created on demand.
    pub fn version_dir(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        ensure_dir(self.version_path(module))
    }

    /// Lock file guarding every version of a module.
    ///
    /// Kept under `locks/`, which neither uninstall nor cache clearing
    /// deletes, so a held lock file is never unlinked.
    pub fn module_lock_file(&self, name: &str) -> Result<PathBuf> {
        let dir = ensure_dir(self.manifest_path().join(LOCKS_DIR))?;
        Ok(dir.join(format!("{}.{}", name, LOCK_EXTENSION)))
    }

    /// `<module>.pkg`
    pub fn package_file_name(&self, module: &ModuleDescriptor) -> String {
        format!("{}.{}", module.name, PACKAGE_EXTENSION)
    }

    pub fn package_file(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        Ok(self.version_dir(module)?.join(self.package_file_name(module)))
    }

    /// Path of the package without creating anything.
    pub fn package_path(&self, module: &ModuleDescriptor) -> PathBuf {
        self.version_path(module).join(self.package_file_name(module))
    }

    pub fn marker_file(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        Ok(self.version_dir(module)?.join(&module.md5))
    }

    pub fn oat_dir(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        ensure_dir(self.version_path(module).join("oat"))
    }

    pub fn native_lib_dir(&self, module: &ModuleDescriptor, abi: &str) -> Result<PathBuf> {
        ensure_dir(self.version_path(module).join("nativeLib").join(abi))
    }

    pub fn code_cache_dir(&self, module: &ModuleDescriptor) -> Result<PathBuf> {
        ensure_dir(self.version_path(module).join("code_cache"))
    }

    /// Scratch space shared by every module of this manifest.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.manifest_path().join(TEMP_DIR))
    }

    pub fn uninstall_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.manifest_path().join(UNINSTALL_DIR))
    }

    /// Whether the installed marker for the module's current hash exists.
    pub fn is_installed(&self, module: &ModuleDescriptor) -> bool {
        self.version_path(module).join(&module.md5).is_file()
    }

    /// Delete a module's versioned directory and everything under it.
    pub fn reset_version_dir(&self, module: &ModuleDescriptor) -> io::Result<()> {
        remove_dir_if_exists(&self.version_path(module))
    }

    /// Delete every version of a module. The caller holds the module lock.
    pub fn remove_module(&self, name: &str) -> io::Result<()> {
        remove_dir_if_exists(&self.module_path(name))
    }

    /// Delete every directory that does not belong to `manifest`: other
    /// manifest identities, modules it no longer lists and stale versions of
    /// the ones it does.
    ///
    /// Module directories are only touched under their module lock. Another
    /// manifest's directory is skipped while any of its module locks is held.
    pub fn clear_cache(&self, manifest: &Manifest, lock_timeout: Option<Duration>) -> Result<CacheReport> {
        let mut report = CacheReport::default();

        if !is_single_component(manifest.id()) || !is_single_component(&self.manifest_id) {
            return Err(SplitError::InvalidManifest {
                message: format!("manifest id '{}' is not a directory name", manifest.id()),
            });
        }
        if !self.root.is_dir() {
            return Ok(report);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !entry.file_type()?.is_dir() || name == MANIFEST_VERSION_DIR || name == manifest.id() {
                continue;
            }
            let Some(_locks) = try_lock_all(&entry.path().join(LOCKS_DIR))? else {
                log::info!("Keeping {}: a module lock is held", entry.path().display());
                continue;
            };
            log::debug!("Removing stale manifest directory {}", entry.path().display());
            report.remove(entry.path())?;
        }

        let manifest_dir = self.root.join(manifest.id());
        if !manifest_dir.is_dir() {
            return Ok(report);
        }

        for entry in fs::read_dir(&manifest_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || RESERVED_NAMES.contains(&name.as_str()) {
                continue;
            }

            let _lock = FileLock::acquire(self.module_lock_file(&name)?, lock_timeout)?;

            let Some(module) = manifest.get(&name) else {
                log::debug!("Removing module {} missing from manifest", name);
                report.remove(entry.path())?;
                continue;
            };

            for version in fs::read_dir(entry.path())? {
                let version = version?;
                if !version.file_type()?.is_dir() || version.file_name().to_string_lossy() == module.version {
                    continue;
                }
                log::debug!("Removing stale version {}", version.path().display());
                report.remove(version.path())?;
            }
        }

        Ok(report)
    }
}

/// Take every lock file in `dir` without waiting. `None` if any is held.
fn try_lock_all(dir: &Path) -> Result<Option<Vec<FileLock>>> {
    let mut locks = Vec::new();
    if !dir.is_dir() {
        return Ok(Some(locks));
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != LOCK_EXTENSION) {
            continue;
        }
        match FileLock::try_acquire(&path)? {
            Some(lock) => locks.push(lock),
            None => return Ok(None),
        }
    }
    Ok(Some(locks))
}
