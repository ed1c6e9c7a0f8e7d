//! Per-instance advisory launch lock.
//!
//! A launch attempt must hold this lock from before configuration
//! resolution until the sandboxed process exits. Two concurrent launches
//! of the same instance would otherwise race on the config file and
//! compile inconsistent plans; the second attempt fails fast with
//! `InstanceAlreadyRunning` instead.
//!
//! The lock is a kernel advisory lock (`flock`) on `{instance}/lock`, so
//! it cannot go stale: the kernel releases it when the holder exits for
//! any reason. The metadata written into the file (pid, launch id,
//! timestamp) is purely diagnostic.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::InstanceError;
use crate::instance::Instance;

/// Diagnostic record written into the lock file while held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// PID of the supervising process.
    pub pid: u32,
    /// Identifier of this launch attempt.
    pub launch_id: Uuid,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// An exclusively held launch lock. Released on drop, on every exit path.
pub struct LaunchLock {
    // Held for the kernel lock; unlocks when dropped.
    _flock: Flock<File>,
    path: PathBuf,
    metadata: LockMetadata,
}

impl std::fmt::Debug for LaunchLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchLock")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl LaunchLock {
    /// Acquires the launch lock for an instance without blocking.
    ///
    /// # Errors
    ///
    /// Returns `InstanceError::AlreadyRunning` if another launch holds
    /// the lock. The held lock's state is not touched in that case.
    #[instrument(skip(instance), fields(name = %instance.name))]
    pub fn acquire(instance: &Instance) -> Result<Self, InstanceError> {
        Self::acquire_path(&instance.paths.lock_file, &instance.name)
    }

    /// Acquires the lock at an explicit path.
    pub fn acquire_path(path: &Path, name: &str) -> Result<Self, InstanceError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| InstanceError::Io {
                context: format!("failed to open lock file: {}", path.display()),
                source: e,
            })?;

        let mut flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
                debug!(name, "Lock held by another launch");
                return Err(InstanceError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
            Err((_, errno)) => {
                return Err(InstanceError::Io {
                    context: format!("failed to lock {}", path.display()),
                    source: std::io::Error::from(errno),
                });
            }
        };

        let metadata = LockMetadata {
            pid: std::process::id(),
            launch_id: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };

        // Best effort: the kernel lock is the source of truth, the JSON
        // body only tells a human who holds it.
        if let Err(e) = write_metadata(&mut flock, &metadata) {
            warn!(error = %e, "Failed to write lock metadata");
        }

        debug!(name, pid = metadata.pid, launch_id = %metadata.launch_id, "Lock acquired");
        Ok(Self {
            _flock: flock,
            path: path.to_path_buf(),
            metadata,
        })
    }

    /// The diagnostic metadata written for this hold.
    #[must_use]
    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_metadata(file: &mut File, metadata: &LockMetadata) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.set_len(0)?;
    file.write_all(json.as_bytes())?;
    file.flush()
}

/// Reads the holder's metadata, if a previous or current holder wrote any.
pub fn read_lock_metadata(path: &Path) -> Option<LockMetadata> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("lock");

        {
            let lock = LaunchLock::acquire_path(&path, "demo").expect("first acquire");
            assert_eq!(lock.metadata().pid, std::process::id());
        }

        // Dropped above, so a second acquire must succeed.
        let _again = LaunchLock::acquire_path(&path, "demo").expect("re-acquire after drop");
    }

    #[test]
    fn test_metadata_written() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("lock");

        let lock = LaunchLock::acquire_path(&path, "demo").expect("acquire");
        let metadata = read_lock_metadata(&path).expect("metadata must be readable");
        assert_eq!(metadata.pid, std::process::id());
        assert_eq!(metadata.launch_id, lock.metadata().launch_id);
    }

    // flock is per open file description, so a second open+lock conflicts
    // even within one process.
    #[test]
    fn test_second_acquire_rejected_while_held() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("lock");

        let _held = LaunchLock::acquire_path(&path, "demo").expect("first acquire");
        let result = LaunchLock::acquire_path(&path, "demo");
        match result {
            Err(InstanceError::AlreadyRunning { name }) => assert_eq!(name, "demo"),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_file_persists_after_release() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("lock");

        {
            let _lock = LaunchLock::acquire_path(&path, "demo").expect("acquire");
        }
        assert!(path.exists(), "lock file should persist for diagnostics");
    }
}
