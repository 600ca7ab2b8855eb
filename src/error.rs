//! Error types for the Strata library
//!
//! Errors fall into four families:
//! - **Fatal/environment** failures (volume full, permission denied on the
//!   snapshot structure, a live concurrent run) abort the run.
//! - **Per-item** failures (a single file that can't be copied) never reach
//!   this type; the backup engine logs and counts them instead.
//! - **Validation** failures are raised before anything on disk is touched.
//! - Everything else is an internal or configuration problem.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Strata library
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for all Strata operations
#[derive(Debug, Error)]
pub enum StrataError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Another live process holds the lock
    #[error("A backup is currently running [{pid}]")]
    AlreadyRunning {
        /// Process id recorded in the lock file
        pid: i32,
        /// Location of the lock file
        lock_path: PathBuf,
    },

    /// Lock file exists but does not hold a process id
    #[error("Invalid lock file {path:?}: {reason}")]
    InvalidLockFile {
        /// Location of the lock file
        path: PathBuf,
        /// What was wrong with its content
        reason: String,
    },

    /// Directory name does not follow the snapshot timestamp pattern
    #[error("Invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    /// Named snapshot does not exist in the backup home
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Backup home contains no complete snapshot
    #[error("No backups have been made yet.")]
    NoSnapshots,

    /// Backup home directory does not exist
    #[error("Backup home does not exist: {0:?}")]
    BackupHomeMissing(PathBuf),

    /// Backup location has not been registered as a backup device
    #[error("Backup location {0:?} isn't registered. Use 'strata register' to register.")]
    NotRegistered(PathBuf),

    /// Backup location is registered already
    #[error("The backup location {0:?} is already registered.")]
    AlreadyRegistered(PathBuf),

    /// Invalid or incomplete configuration
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Ignore pattern could not be compiled
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Usage of the backup volume could not be determined
    #[error("Unable to read disk usage for {path:?}: {reason}")]
    DiskUsage {
        /// Path on the volume that was probed
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Hook script could not be started
    #[error("Hook execution error: {0}")]
    HookExecution(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create a validation error with a custom message
    pub fn validation(msg: impl Into<String>) -> Self {
        StrataError::Validation(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }

    /// Check if this error is an environment failure that aborts a run
    pub fn is_fatal(&self) -> bool {
        match self {
            StrataError::AlreadyRunning { .. } => true,
            StrataError::Io(e) => {
                e.kind() == std::io::ErrorKind::PermissionDenied
                    || matches!(
                        e.raw_os_error(),
                        Some(nix::libc::ENOSPC) | Some(nix::libc::EROFS) | Some(nix::libc::EDQUOT)
                    )
            }
            _ => false,
        }
    }

    /// Check if this error was raised while validating input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StrataError::Validation(_)
                | StrataError::NotRegistered(_)
                | StrataError::AlreadyRegistered(_)
                | StrataError::BackupHomeMissing(_)
                | StrataError::InvalidPattern(_)
                | StrataError::Config(_)
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            StrataError::Io(e) if e.raw_os_error() == Some(nix::libc::ENOSPC) => {
                "Backup drive is full".to_string()
            }
            StrataError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                "Permission denied".to_string()
            }
            StrataError::Io(e) if e.raw_os_error() == Some(nix::libc::EROFS) => {
                "Operation not permitted on the mounted backup file system".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Process exit status for this error
    ///
    /// I/O failures surface their OS errno so scripts can tell a full volume
    /// from a permission problem; everything else exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            StrataError::Io(e) => e.raw_os_error().filter(|code| *code > 0).unwrap_or(1),
            _ => 1,
        }
    }
}
