//! Per-target mutual exclusion
//!
//! Exclusive `flock`-style locks on files under `<backup root>/locks/`. Each
//! open handle is its own lock owner, so two pipelines in the same process
//! exclude each other just like two processes do. The lock is released when the
//! guard drops, on every exit path.

use crate::VaultError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the lock serializes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Backup creation
    Backup,
    /// Restore into the target
    Restore,
    /// Shared by manual, post-backup and scheduled retention runs
    Retention,
}

impl LockScope {
    fn as_str(&self) -> &'static str {
        match self {
            LockScope::Backup => "backup",
            LockScope::Restore => "restore",
            LockScope::Retention => "retention",
        }
    }
}

#[derive(Serialize)]
struct LockHolder<'a> {
    pid: u32,
    scope: LockScope,
    target: &'a str,
    acquired_at: DateTime<Utc>,
}

/// Held advisory lock; released on drop
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
    scope: LockScope,
}

impl TargetLock {
    /// Take the lock without blocking, or fail with [`VaultError::Busy`]
    pub fn try_acquire(lock_dir: &Path, target_id: &str, scope: LockScope) -> Result<Self, VaultError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.{}.lock", target_id, scope.as_str()));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            return Err(if contended {
                VaultError::Busy(format!("{} already in progress for {}", scope.as_str(), target_id))
            } else {
                VaultError::Io(e)
            });
        }

        let holder = LockHolder {
            pid: std::process::id(),
            scope,
            target: target_id,
            acquired_at: Utc::now(),
        };
        // Holder info is diagnostic only.
        if let Ok(json) = serde_json::to_string(&holder) {
            let _ = write_holder(&mut file, &json);
        }

        debug!(lock = %path.display(), "Acquired {} lock", scope.as_str());
        Ok(Self { file, path, scope })
    }

    /// What this lock serializes
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// The lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_holder(file: &mut File, json: &str) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(lock = %self.path.display(), "Released {} lock", self.scope.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let held = TargetLock::try_acquire(dir.path(), "db_5432_app", LockScope::Backup).unwrap();

        let second = TargetLock::try_acquire(dir.path(), "db_5432_app", LockScope::Backup);
        assert!(matches!(second, Err(VaultError::Busy(_))));

        // Different scope and different target are independent.
        let _restore = TargetLock::try_acquire(dir.path(), "db_5432_app", LockScope::Restore).unwrap();
        let _other = TargetLock::try_acquire(dir.path(), "db_5432_other", LockScope::Backup).unwrap();

        drop(held);
        TargetLock::try_acquire(dir.path(), "db_5432_app", LockScope::Backup).unwrap();
    }
}
