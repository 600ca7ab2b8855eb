//! Single-instance locking for a backup home
//!
//! The lock is a plain file holding the decimal process id of its holder.
//! A lock whose pid no longer names a live process is stale and replaced;
//! a live one makes the new run fail immediately with
//! [`StrataError::AlreadyRunning`]. There is no waiting and no retry.
//!
//! Liveness is asked of a [`ProcessProbe`], so tests can fake it:
//!
//! ```rust
//! use strata::lock::{LockFile, ProcessProbe};
//!
//! struct NobodyAlive;
//!
//! impl ProcessProbe for NobodyAlive {
//!     fn is_alive(&self, _pid: i32) -> bool { false }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::TempDir::new()?;
//! let lock = LockFile::with_probe(dir.path().join("strata.lock"), NobodyAlive);
//! let guard = lock.acquire()?;
//! // ... run ...
//! guard.release()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, StrataError};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Answers whether a process id currently names a live process
pub trait ProcessProbe {
    /// `true` if a process with this id exists, whoever owns it
    fn is_alive(&self, pid: i32) -> bool;
}

/// Liveness probe backed by `kill(pid, 0)`
///
/// `EPERM` means the process exists but belongs to someone else, which
/// still counts as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

impl<P: ProcessProbe + ?Sized> ProcessProbe for &P {
    fn is_alive(&self, pid: i32) -> bool {
        (**self).is_alive(pid)
    }
}

impl<P: ProcessProbe + ?Sized> ProcessProbe for Box<P> {
    fn is_alive(&self, pid: i32) -> bool {
        (**self).is_alive(pid)
    }
}

/// PID-bearing lock file
#[derive(Debug)]
pub struct LockFile<P = SystemProbe> {
    path: PathBuf,
    probe: P,
}

impl LockFile<SystemProbe> {
    /// Lock file at `path` using the system liveness probe
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, SystemProbe)
    }
}

impl<P: ProcessProbe> LockFile<P> {
    /// Lock file at `path` with a custom liveness probe
    pub fn with_probe(path: impl Into<PathBuf>, probe: P) -> Self {
        Self {
            path: path.into(),
            probe,
        }
    }

    /// Location of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process id recorded in the lock file, if one exists
    pub fn holder(&self) -> Result<Option<i32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let first_line = content.lines().next().unwrap_or("").trim();
        first_line
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Some)
            .ok_or_else(|| StrataError::InvalidLockFile {
                path: self.path.clone(),
                reason: format!("expected a process id, found {:?}", first_line),
            })
    }

    /// Take the lock for the current process
    ///
    /// # Errors
    ///
    /// - [`StrataError::AlreadyRunning`] if the recorded process is alive
    /// - [`StrataError::Io`] if the lock file can't be read, removed or written
    pub fn acquire(&self) -> Result<LockGuard> {
        match self.holder() {
            Ok(Some(pid)) if self.probe.is_alive(pid) => {
                return Err(StrataError::AlreadyRunning {
                    pid,
                    lock_path: self.path.clone(),
                });
            }
            Ok(Some(pid)) => {
                info!("Removing stale lock {:?} left by pid {}", self.path, pid);
                remove_if_present(&self.path)?;
            }
            Ok(None) => {}
            Err(StrataError::InvalidLockFile { reason, .. }) => {
                // The pid is written before the file appears, so an
                // unreadable lock can't belong to a running instance
                warn!("Discarding unreadable lock {:?}: {}", self.path, reason);
                remove_if_present(&self.path)?;
            }
            Err(e) => return Err(e),
        }

        let pid = std::process::id() as i32;
        self.create(pid)?;
        debug!("Acquired lock {:?} for pid {}", self.path, pid);
        Ok(LockGuard {
            path: self.path.clone(),
            released: false,
        })
    }

    /// Write the pid to a temporary file and link it into place without
    /// clobbering, so the lock never exists without its content
    fn create(&self, pid: i32) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        writeln!(temp, "{}", pid)?;
        temp.flush()?;

        match temp.persist_noclobber(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Another instance won the race after the stale check
                let pid = self.holder().ok().flatten().unwrap_or_default();
                Err(StrataError::AlreadyRunning {
                    pid,
                    lock_path: self.path.clone(),
                })
            }
            Err(e) => Err(e.error.into()),
        }
    }
}

/// Remove a lock file unconditionally
pub fn release(path: &Path) -> Result<()> {
    remove_if_present(path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Held lock; the lock file is removed on drop
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Location of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now and report failures instead of logging them
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release(&self.path) {
            warn!("Failed to remove lock {:?}: {}", self.path, e);
        } else {
            debug!("Released lock {:?}", self.path);
        }
    }
}
