//! Exclusive per-host run lock.
//!
//! A [`RunLock`] holds an OS advisory lock on a lock file for as long as it
//! lives. The file body is a JSON [`LockInfo`] for whoever finds it on disk.
//! Acquisition never waits: if another process holds the lock the call fails
//! with [`SyncError::Lock`] at once.
//!
//! The locking primitive is picked at compile time: `flock(2)` on Unix,
//! `File::try_lock` elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub command: String,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
        }
    }
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: Option<File>,
}

/// Outcome of locking an already opened lock file.
#[derive(Debug)]
pub enum LockAttempt {
    Locked(RunLock),
    /// The file was unlinked or replaced after it was opened.
    Stale,
}

/// Reopen attempts when the lock file keeps changing under us.
const MAX_STALE_RETRIES: usize = 5;

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, SyncError> {
        for attempt in 0..MAX_STALE_RETRIES {
            let file = open_lock_file(path)?;
            match Self::lock_opened(path, file)? {
                LockAttempt::Locked(lock) => return Ok(lock),
                LockAttempt::Stale => {
                    tracing::debug!(path = %path.display(), attempt, "lock file replaced, reopening")
                }
            }
        }
        Err(SyncError::Lock(format!(
            "lock file {} kept being replaced",
            path.display()
        )))
    }

    /// Lock `file`, which was opened from `path`, and claim it.
    ///
    /// Holding the lock only counts when the locked file is still the one
    /// at `path`; a holder unlinks the file before unlocking it.
    pub fn lock_opened(path: &Path, mut file: File) -> Result<LockAttempt, SyncError> {
        sys::try_lock_exclusive(&file).map_err(|e| match e {
            sys::LockFailure::Held => SyncError::Lock(format!(
                "another sync is already running (lock held on {})",
                path.display()
            )),
            sys::LockFailure::Os(e) => {
                SyncError::Lock(format!("cannot lock {}: {}", path.display(), e))
            }
        })?;

        match sys::is_linked_at(&file, path) {
            Ok(true) => {}
            Ok(false) => return Ok(LockAttempt::Stale),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockAttempt::Stale),
            Err(e) => {
                return Err(SyncError::Lock(format!("cannot stat {}: {}", path.display(), e)))
            }
        }

        let info = LockInfo::current();
        let body = serde_json::to_vec_pretty(&info)?;
        file.set_len(0)
            .and_then(|_| file.write_all(&body))
            .and_then(|_| file.flush())
            .map_err(|e| SyncError::Lock(format!("cannot write {}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), pid = info.pid, "run lock acquired");
        Ok(LockAttempt::Locked(Self {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file, then unlock and close it. Failures are logged only.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "run lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to remove lock file: {}", e)
            }
        }
        if let Err(e) = sys::unlock(&file) {
            tracing::warn!(path = %self.path.display(), "failed to unlock: {}", e);
        }
        drop(file);
    }
}

/// Open (creating if needed) the lock file at `path` without locking it.
pub fn open_lock_file(path: &Path) -> Result<File, SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::Lock(format!("{}: {}", parent.display(), e)))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SyncError::Lock(format!("cannot open {}: {}", path.display(), e)))
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Read the diagnostic body of a lock file, if one is present and parseable.
pub fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub enum LockFailure {
        Held,
        Os(io::Error),
    }

    pub fn try_lock_exclusive(file: &File) -> Result<(), LockFailure> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(());
        }
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(LockFailure::Held)
        } else {
            Err(LockFailure::Os(errno))
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Whether `path` still names the inode behind `file`.
    pub fn is_linked_at(file: &File, path: &Path) -> io::Result<bool> {
        let held = file.metadata()?;
        let on_disk = std::fs::metadata(path)?;
        Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::{File, TryLockError};
    use std::io;
    use std::path::Path;

    pub enum LockFailure {
        Held,
        Os(io::Error),
    }

    pub fn try_lock_exclusive(file: &File) -> Result<(), LockFailure> {
        match file.try_lock() {
            Ok(()) => Ok(()),
            Err(TryLockError::WouldBlock) => Err(LockFailure::Held),
            Err(TryLockError::Error(e)) => Err(LockFailure::Os(e)),
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        file.unlock()
    }

    /// No portable file identity here; only checks the path is still present.
    pub fn is_linked_at(_file: &File, path: &Path) -> io::Result<bool> {
        std::fs::metadata(path).map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kbsync.lock");

        let first = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);
        assert!(matches!(second, Err(SyncError::Lock(_))));

        first.release();
        assert!(!path.exists());
        let third = RunLock::acquire(&path).unwrap();
        drop(third);
    }

    #[test]
    fn test_lock_file_describes_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("kbsync.lock");
        let lock = RunLock::acquire(&path).unwrap();
        let info = read_lock_info(lock.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_handle_opened_before_release_cannot_lock_orphaned_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kbsync.lock");

        let first = RunLock::acquire(&path).unwrap();
        let waiting = open_lock_file(&path).unwrap();
        first.release();

        let attempt = RunLock::lock_opened(&path, waiting).unwrap();
        assert!(matches!(attempt, LockAttempt::Stale));
        assert!(!path.exists());

        let next = RunLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(next);
    }

    #[test]
    fn test_handle_opened_before_release_loses_to_new_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kbsync.lock");

        let first = RunLock::acquire(&path).unwrap();
        let waiting = open_lock_file(&path).unwrap();
        first.release();

        let holder = RunLock::acquire(&path).unwrap();
        let attempt = RunLock::lock_opened(&path, waiting).unwrap();
        assert!(matches!(attempt, LockAttempt::Stale));
        assert!(matches!(RunLock::acquire(&path), Err(SyncError::Lock(_))));

        holder.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kbsync.lock");
        {
            let _lock = RunLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(RunLock::acquire(&path).is_ok());
    }
}
