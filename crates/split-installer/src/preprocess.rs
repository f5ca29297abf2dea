//! Reconciles each module's on-disk state before any network activity.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::downloader::DownloadRequest;
use crate::error::{Result, SplitError};
use crate::integrity::{verify_content, ChecksumType, HashingWriter};
use crate::lock::FileLock;
use crate::manifest::ModuleDescriptor;
use crate::paths::PathStore;
use crate::util::retry;

/// Store of packages shipped with the host application.
pub trait BundledSource: Send + Sync {
    /// Open the bundled package of `module`, or `None` if it is not bundled.
    fn open(&self, module: &ModuleDescriptor) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// A path the package can be read from in place, without copying.
    fn direct_path(&self, _module: &ModuleDescriptor) -> Option<PathBuf> {
        None
    }
}

/// Bundled packages stored as `<dir>/<module>.zip`.
#[derive(Debug, Clone)]
pub struct BundledDir {
    root: PathBuf,
    direct: bool,
}

impl BundledDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            direct: false,
        }
    }

    /// Read packages in place instead of copying them into the layout.
    pub fn with_direct_access(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    fn file_for(&self, module: &ModuleDescriptor) -> PathBuf {
        self.root.join(format!("{}.zip", module.name))
    }
}

impl BundledSource for BundledDir {
    fn open(&self, module: &ModuleDescriptor) -> io::Result<Option<Box<dyn Read + Send>>> {
        match File::open(self.file_for(module)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn direct_path(&self, module: &ModuleDescriptor) -> Option<PathBuf> {
        let path = self.file_for(module);
        (self.direct && path.is_file()).then_some(path)
    }
}

/// What still has to be fetched for a batch of modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    pub total_bytes: u64,
    pub bytes_needed: u64,
    pub requests: Vec<DownloadRequest>,
}

pub struct DownloadPreprocessor<'a> {
    paths: &'a PathStore,
    bundled: Option<&'a dyn BundledSource>,
    max_attempts: u32,
    lock_timeout: Option<Duration>,
}

impl<'a> DownloadPreprocessor<'a> {
    pub fn new(paths: &'a PathStore) -> Self {
        Self {
            paths,
            bundled: None,
            max_attempts: 3,
            lock_timeout: None,
        }
    }

    pub fn with_bundled(mut self, bundled: Option<&'a dyn BundledSource>) -> Self {
        self.bundled = bundled;
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

    /// Prepare every module, returning the bytes and requests still needed.
    ///
    /// Failures other than lock timeouts are reported as
    /// [`SplitError::BundledCopyFailed`].
    pub fn prepare(&self, modules: &[ModuleDescriptor]) -> Result<DownloadPlan> {
        let mut plan = DownloadPlan::default();

        for module in modules {
            plan.total_bytes += module.size;
            let request = self.prepare_module(module).map_err(|e| match e {
                SplitError::LockTimeout { .. } | SplitError::BundledCopyFailed { .. } => e,
                other => SplitError::BundledCopyFailed {
                    module: module.name.clone(),
                    reason: other.to_string(),
                },
            })?;

            if let Some(request) = request {
                plan.bytes_needed += module.size;
                plan.requests.push(request);
            }
        }

        log::debug!(
            "Prepared {} module(s): {} of {} bytes still needed",
            modules.len(),
            plan.bytes_needed,
            plan.total_bytes
        );
        Ok(plan)
    }

    /// Returns the request for the module's package if it still has to be
    /// downloaded.
    fn prepare_module(&self, module: &ModuleDescriptor) -> Result<Option<DownloadRequest>> {
        let _lock = FileLock::acquire(self.paths.module_lock_file(&module.name)?, self.lock_timeout)?;

        if module.built_in {
            if let Some(direct) = self.bundled.and_then(|b| b.direct_path(module)) {
                if verify_content(&direct, &module.md5, module.size)? {
                    return Ok(None);
                }
                return Err(SplitError::BundledCopyFailed {
                    module: module.name.clone(),
                    reason: format!("{} does not match the manifest", direct.display()),
                });
            }
        }

        let package = self.paths.package_path(module);
        if package.exists() {
            if verify_content(&package, &module.md5, module.size)? {
                return Ok(None);
            }
            log::warn!(
                "Package of {} is corrupted, resetting {}",
                module.name,
                package.parent().unwrap_or(&package).display()
            );
            self.paths.reset_version_dir(module)?;
        }

        if !module.built_in {
            return self.request_for(module).map(Some);
        }

        let Some(bundled) = self.bundled else {
            return self.bundled_missing(module);
        };

        let what = format!("Copying bundled package of {}", module.name);
        let copied = retry(self.max_attempts, &what, |_| self.copy_bundled(bundled, module));
        match copied {
            Ok(true) => Ok(None),
            Ok(false) => self.bundled_missing(module),
            Err(e) => {
                self.paths.reset_version_dir(module)?;
                Err(SplitError::BundledCopyFailed {
                    module: module.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// A built-in module without a bundled copy can still be fetched if it
    /// has a URL.
    fn bundled_missing(&self, module: &ModuleDescriptor) -> Result<Option<DownloadRequest>> {
        if module.url.is_empty() {
            return Err(SplitError::BundledCopyFailed {
                module: module.name.clone(),
                reason: "no bundled package and no download url".to_string(),
            });
        }
        log::debug!("No bundled package for {}, falling back to download", module.name);
        self.request_for(module).map(Some)
    }

    fn request_for(&self, module: &ModuleDescriptor) -> Result<DownloadRequest> {
        Ok(DownloadRequest {
            url: module.url.clone(),
            file_dir: self.paths.version_dir(module)?,
            file_name: self.paths.package_file_name(module),
            module_name: module.name.clone(),
            md5: module.md5.clone(),
            size: module.size,
        })
    }

    /// Copy the bundled package into place. `Ok(false)` if there is none.
    fn copy_bundled(&self, bundled: &dyn BundledSource, module: &ModuleDescriptor) -> Result<bool> {
        let Some(mut source) = bundled.open(module)? else {
            return Ok(false);
        };

        let target = self.paths.package_file(module)?;
        let parent = target.parent().unwrap_or(Path::new("."));
        let tmp = NamedTempFile::new_in(parent)?;

        let mut writer = HashingWriter::new(BufWriter::new(tmp.as_file()));
        io::copy(&mut source, &mut writer)?;
        let written = writer.written();
        let (buffered, md5) = writer.finish();
        buffered.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        let matches = match ChecksumType::from_hex_length(module.md5.len()) {
            Some(ChecksumType::Md5) => md5.eq_ignore_ascii_case(&module.md5),
            _ => written == module.size,
        };
        if !matches {
            return Err(SplitError::ChecksumMismatch {
                module: module.name.clone(),
            });
        }

        tmp.persist(&target).map_err(|e| SplitError::Io(e.error))?;
        log::info!("Materialized bundled package of {}", module.name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::test_support::md5_hex;
    use std::fs;
    use tempfile::TempDir;

    fn remote(name: &str, data: &[u8]) -> ModuleDescriptor {
        let mut module = ModuleDescriptor::new(name, "1.0", md5_hex(data), data.len() as u64);
        module.url = format!("https://cdn.example.com/{}.zip", name);
        module
    }

    fn builtin(name: &str, data: &[u8]) -> ModuleDescriptor {
        let mut module = ModuleDescriptor::new(name, "1.0", md5_hex(data), data.len() as u64);
        module.built_in = true;
        module
    }

    #[test]
    fn test_missing_remote_package_needs_download() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = remote("m1", b"remote bytes");

        let plan = DownloadPreprocessor::new(&paths).prepare(&[module.clone()]).unwrap();

        assert_eq!(plan.total_bytes, module.size);
        assert_eq!(plan.bytes_needed, module.size);
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].target(), paths.package_path(&module));
        assert_eq!(plan.requests[0].url, module.url);
    }

    #[test]
    fn test_valid_existing_package_needs_nothing() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = remote("m1", b"remote bytes");
        fs::write(paths.package_file(&module).unwrap(), b"remote bytes").unwrap();

        let plan = DownloadPreprocessor::new(&paths).prepare(&[module.clone()]).unwrap();
        assert_eq!(plan.bytes_needed, 0);
        assert!(plan.requests.is_empty());
    }

    #[test]
    fn test_corrupted_package_resets_whole_version_dir() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = remote("m1", b"remote bytes");
        fs::write(paths.package_file(&module).unwrap(), b"garbage").unwrap();
        let stale_lib = paths.native_lib_dir(&module, "x86").unwrap().join("liba.so");
        fs::write(&stale_lib, b"old").unwrap();
        fs::write(paths.marker_file(&module).unwrap(), b"").unwrap();

        let plan = DownloadPreprocessor::new(&paths).prepare(&[module.clone()]).unwrap();

        assert_eq!(plan.bytes_needed, module.size);
        assert!(!stale_lib.exists());
        assert!(!paths.is_installed(&module));
        assert!(!paths.package_path(&module).exists());
    }

    #[test]
    fn test_bundled_package_is_materialized() {
        let dir = TempDir::new().unwrap();
        let bundled_dir = dir.path().join("bundled");
        fs::create_dir_all(&bundled_dir).unwrap();
        fs::write(bundled_dir.join("m2.zip"), b"bundled bytes").unwrap();
        let bundled = BundledDir::new(&bundled_dir);
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = builtin("m2", b"bundled bytes");

        let plan = DownloadPreprocessor::new(&paths)
            .with_bundled(Some(&bundled))
            .prepare(&[module.clone()])
            .unwrap();

        assert_eq!(plan.total_bytes, module.size);
        assert_eq!(plan.bytes_needed, 0);
        assert_eq!(fs::read(paths.package_path(&module)).unwrap(), b"bundled bytes");
    }

    #[test]
    fn test_bundled_package_read_in_place() {
        let dir = TempDir::new().unwrap();
        let bundled_dir = dir.path().join("bundled");
        fs::create_dir_all(&bundled_dir).unwrap();
        fs::write(bundled_dir.join("m2.zip"), b"bundled bytes").unwrap();
        let bundled = BundledDir::new(&bundled_dir).with_direct_access(true);
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = builtin("m2", b"bundled bytes");

        let plan = DownloadPreprocessor::new(&paths)
            .with_bundled(Some(&bundled))
            .prepare(&[module.clone()])
            .unwrap();

        assert_eq!(plan.bytes_needed, 0);
        assert!(!paths.package_path(&module).exists());
    }

    #[test]
    fn test_corrupted_bundled_package_fails() {
        let dir = TempDir::new().unwrap();
        let bundled_dir = dir.path().join("bundled");
        fs::create_dir_all(&bundled_dir).unwrap();
        fs::write(bundled_dir.join("m2.zip"), b"not what the manifest says").unwrap();
        let bundled = BundledDir::new(&bundled_dir);
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = builtin("m2", b"bundled bytes");

        let err = DownloadPreprocessor::new(&paths)
            .with_bundled(Some(&bundled))
            .prepare(&[module.clone()])
            .unwrap_err();

        assert!(matches!(err, SplitError::BundledCopyFailed { .. }));
        assert!(!paths.package_path(&module).exists());
    }

    #[test]
    fn test_builtin_without_bundled_copy_or_url_fails() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::new(dir.path().join("root"), "q1");
        let module = builtin("m2", b"bundled bytes");

        let err = DownloadPreprocessor::new(&paths).prepare(&[module]).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BuiltinSplitApkCopiedFailed);
    }
}
