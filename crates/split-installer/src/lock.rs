//! Cross-process exclusive file locks.
//!
//! Every operation that mutates a module directory holds one of these for
//! its whole duration. Locks are advisory (`flock`/`LockFileEx`) and are
//! released when the guard drops, or by the OS if the holder dies.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Result, SplitError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Guard holding an exclusive lock on a lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }

    /// Acquire the lock at `path`.
    ///
    /// With `timeout == None` this blocks until the holder releases it. With a
    /// timeout, it polls and fails with [`SplitError::LockTimeout`].
    pub fn acquire(path: impl AsRef<Path>, timeout: Option<Duration>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        match timeout {
            None => file.lock_exclusive()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                            if Instant::now() >= deadline {
                                return Err(SplitError::LockTimeout { path });
                            }
                            thread::sleep(POLL_INTERVAL);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        log::trace!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Try once without waiting; `None` if another holder has it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        log::trace!("Released lock {}", self.path.display());
    }
}
