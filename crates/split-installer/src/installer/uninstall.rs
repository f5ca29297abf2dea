//! Durable record of modules awaiting removal at the next process start.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::lock::FileLock;
use crate::paths::PathStore;
use crate::util::{read_kv, remove_file_if_exists, retry, write_kv};

const RECORD_FILE: &str = "uninstallsplits.info";
const LOCK_FILE: &str = "uninstall.lock";
const SPLITS_KEY: &str = "uninstallSplits";

/// `<root>/<manifestId>/uninstall/uninstallsplits.info`
pub struct PendingUninstall {
    dir: PathBuf,
    lock_timeout: Option<Duration>,
    max_attempts: u32,
}

impl PendingUninstall {
    pub fn new(paths: &PathStore, lock_timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            dir: paths.uninstall_dir()?,
            lock_timeout,
            max_attempts: 3,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(self.dir.join(LOCK_FILE), self.lock_timeout)
    }

    fn read(&self) -> Result<BTreeSet<String>> {
        let record = read_kv(&self.record_path())?;
        Ok(record
            .get(SPLITS_KEY)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write(&self, names: &BTreeSet<String>) -> Result<()> {
        if names.is_empty() {
            remove_file_if_exists(&self.record_path())?;
            return Ok(());
        }
        let mut record = BTreeMap::new();
        record.insert(
            SPLITS_KEY.to_string(),
            names.iter().cloned().collect::<Vec<_>>().join(","),
        );
        write_kv(&self.record_path(), &record)?;
        Ok(())
    }

    /// Add `names` to the record. Returns everything now pending.
    pub fn record(&self, names: &[String]) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        let mut pending = self.read()?;
        pending.extend(names.iter().cloned());
        self.write(&pending)?;
        log::info!("Scheduled removal of {}", names.join(", "));
        Ok(pending.into_iter().collect())
    }

    pub fn pending(&self) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        Ok(self.read()?.into_iter().collect())
    }

    /// Remove every pending module. The record is cleared only once all
    /// removals succeeded.
    pub fn run_pending(&self, paths: &PathStore) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        let pending = self.read()?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        for name in &pending {
            let _module_lock = FileLock::acquire(paths.module_lock_file(name)?, self.lock_timeout)?;
            let what = format!("Removing module {}", name);
            retry(self.max_attempts, &what, |_| Ok(paths.remove_module(name)?))?;
            log::info!("Removed module {}", name);
        }

        self.write(&BTreeSet::new())?;
        Ok(pending.into_iter().collect())
    }
}
