//! Durable manifest version record.
//!
//! An update stores the new manifest next to the old one and records
//! `oldVersion`/`newVersion`. The new version only becomes current at the
//! next start of the main process, which must then stop its sibling
//! processes so that every process reloads the same manifest.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SplitError};
use crate::lock::FileLock;
use crate::paths::MANIFEST_VERSION_DIR;
use crate::util::{atomic_write, read_kv, write_kv};

use super::Manifest;

const VERSION_FILE: &str = "version.info";
const LOCK_FILE: &str = "version.lock";
const OLD_VERSION_KEY: &str = "oldVersion";
const NEW_VERSION_KEY: &str = "newVersion";

/// What happened to the manifest version at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStartup {
    /// No version was ever recorded.
    Unversioned,
    /// The current version did not change.
    Unchanged { current: String },
    /// `to` became current; sibling processes must be terminated.
    Promoted { from: String, to: String },
}

/// Manages `<root>/manifest_version/`.
#[derive(Debug, Clone)]
pub struct ManifestVersions {
    dir: PathBuf,
    lock_timeout: Option<Duration>,
}

impl ManifestVersions {
    pub fn new(root: &Path, lock_timeout: Option<Duration>) -> Self {
        Self {
            dir: root.join(MANIFEST_VERSION_DIR),
            lock_timeout,
        }
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(self.dir.join(LOCK_FILE), self.lock_timeout)
    }

    fn manifest_file(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{}.json", version))
    }

    fn read_record(&self) -> Result<BTreeMap<String, String>> {
        Ok(read_kv(&self.dir.join(VERSION_FILE))?)
    }

    /// Store `manifest_file` as `new_version`, to be promoted at next start.
    pub fn update(&self, new_version: &str, manifest_file: &Path) -> Result<()> {
        if new_version.trim().is_empty() || new_version.contains(['/', '\\', '=']) {
            return Err(SplitError::InvalidRequest(format!(
                "invalid manifest version '{}'",
                new_version
            )));
        }

        // Refuse to record a manifest that would fail to load later.
        let manifest = Manifest::load(manifest_file)?;

        let _lock = self.lock()?;
        atomic_write(&self.manifest_file(new_version), manifest.to_json()?.as_bytes())?;

        let mut record = self.read_record()?;
        // With nothing recorded yet there is no running manifest to keep
        // consistent, so the first version is current right away.
        record
            .entry(OLD_VERSION_KEY.to_string())
            .or_insert_with(|| new_version.to_string());
        record.insert(NEW_VERSION_KEY.to_string(), new_version.to_string());
        write_kv(&self.dir.join(VERSION_FILE), &record)?;

        log::info!("Recorded manifest version {} for next start", new_version);
        Ok(())
    }

    /// Promote a pending version. Only the main process promotes.
    pub fn on_process_start(&self, main_process: bool) -> Result<VersionStartup> {
        let _lock = self.lock()?;
        let mut record = self.read_record()?;

        let (old, new) = match (record.get(OLD_VERSION_KEY), record.get(NEW_VERSION_KEY)) {
            (Some(old), Some(new)) => (old.clone(), new.clone()),
            (Some(old), None) => return Ok(VersionStartup::Unchanged { current: old.clone() }),
            (None, Some(new)) => (String::new(), new.clone()),
            (None, None) => return Ok(VersionStartup::Unversioned),
        };

        if old == new || !main_process {
            if old.is_empty() {
                return Ok(VersionStartup::Unversioned);
            }
            return Ok(VersionStartup::Unchanged { current: old });
        }

        record.insert(OLD_VERSION_KEY.to_string(), new.clone());
        write_kv(&self.dir.join(VERSION_FILE), &record)?;
        log::info!("Promoted manifest version {} -> {}", old, new);

        Ok(VersionStartup::Promoted { from: old, to: new })
    }

    /// The version currently in effect, if any.
    pub fn current_version(&self) -> Result<Option<String>> {
        let record = self.read_record()?;
        Ok(record
            .get(OLD_VERSION_KEY)
            .filter(|v| !v.is_empty())
            .cloned())
    }

    /// Load the manifest of the current version.
    pub fn current_manifest(&self) -> Result<Option<Manifest>> {
        let Some(version) = self.current_version()? else {
            return Ok(None);
        };
        let path = self.manifest_file(&version);
        if !path.is_file() {
            return Err(SplitError::InvalidManifest {
                message: format!("manifest for version {} is missing", version),
            });
        }
        Manifest::load(&path).map(Some)
    }

    /// Remove stored manifests other than the current and pending versions.
    pub fn prune(&self) -> Result<usize> {
        let _lock = self.lock()?;
        let record = self.read_record()?;
        let keep: Vec<String> = record
            .values()
            .map(|v| format!("{}.json", v))
            .collect();

        let mut removed = 0;
        if !self.dir.is_dir() {
            return Ok(removed);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !keep.contains(&name) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
