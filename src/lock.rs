//! Run-overlap protection.
//!
//! Cron can start a new run while a previous one is still blocked on the
//! monitor. Both would share the run log and working directory, so each run
//! holds an exclusive advisory lock for its whole duration.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from lock operations.
#[derive(Debug)]
pub enum LockError {
    /// Another run holds the lock.
    Held { path: PathBuf },
    /// The lock file could not be created or opened.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Locking failed for a reason other than contention.
    Acquire {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { path } => write!(
                f,
                "another run is already in progress (lock held: {})",
                path.display()
            ),
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::Acquire { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held { .. } => None,
            LockError::Open { source, .. } => Some(source),
            LockError::Acquire { source, .. } => Some(source),
        }
    }
}

/// Holds the exclusive lock until dropped.
///
/// The lock file itself is left in place; the OS releases the lock when the
/// file handle closes, including when the process dies.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                });
            }
            return Err(LockError::Acquire {
                path: path.to_path_buf(),
                source: e,
            });
        }

        // Best-effort owner note for operators inspecting a stuck lock.
        let _ = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()));

        tracing::debug!(path = %path.display(), "acquired run lock");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "releasing run lock");
    }
}
