//! Core data types used throughout the Strata library
//!
//! This module contains the data structures shared by the backup engine,
//! the snapshot lifecycle and the retention engine.
//!
//! ## Overview
//!
//! - **File System State**: `FileEntry`, `EntryKind` - one item captured during a walk
//! - **Decisions**: `ChangeKind`, `BackupAction`, `SkipReason` - what the walk decided to do
//! - **Results**: `BackupStats`, `SweepReport`, `RetentionReport` - what a run did
//! - **Collaborators**: `OutputSink`, `BackupHook` - progress lines and hook callbacks
//!
//! ## Examples
//!
//! ```rust
//! use strata::types::{BackupStats, OutputSink, SilentSink};
//!
//! let mut stats = BackupStats::default();
//! stats.files_copied = 3;
//! stats.files_linked = 7;
//! assert_eq!(stats.total_files(), 10);
//!
//! // Any closure taking a line works as a sink
//! let sink = |line: &str| println!("{}", line);
//! sink.line("Copying: /etc/hosts");
//! SilentSink.line("dropped");
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// Type of a captured file system item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link (never dereferenced)
    Symlink,
    /// Fifo, socket or device node
    Special,
}

impl EntryKind {
    /// Derive the kind from a non-following file type
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        }
    }
}

/// A file, directory or symlink captured during a walk
///
/// Attributes come from `symlink_metadata`, so a symlink describes the link
/// itself and never its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the source root
    pub path: PathBuf,
    /// Item type
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: DateTime<Utc>,
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Unix permission bits
    pub permissions: u32,
}

impl FileEntry {
    /// Build an entry from already-fetched metadata
    pub fn from_metadata(path: PathBuf, metadata: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        let modified = DateTime::from_timestamp(metadata.mtime(), metadata.mtime_nsec() as u32)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Self {
            path,
            kind: EntryKind::from_file_type(metadata.file_type()),
            size: metadata.len(),
            modified,
            uid: metadata.uid(),
            gid: metadata.gid(),
            permissions: metadata.mode() & 0o7777,
        }
    }

    /// Modification time truncated to whole seconds
    pub fn modified_secs(&self) -> i64 {
        self.modified.timestamp()
    }
}

/// Outcome of comparing a source item with the previous snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    /// Nothing exists at the equivalent path in the previous snapshot
    New,
    /// The previous item's modification time differs
    Modified,
    /// The previous item can be shared
    Unchanged,
}

/// Why an item was left out of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Matched an ignore rule or an excluded path
    Ignored,
    /// Larger than the configured maximum
    TooLarge {
        /// Actual size in bytes
        size: u64,
        /// Configured limit in bytes
        limit: u64,
    },
    /// Fifo, socket or device node
    SpecialFile,
    /// Could not be read during the walk
    Unreadable(String),
}

/// One step of materializing a snapshot
///
/// The walk produces these in order; the applier performs them. A
/// `FinishDirectory` always follows every action for the directory's
/// children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupAction {
    /// Create the destination directory (if absent) mirroring the source's mode and owner
    CreateDirectory {
        /// Source directory
        source: PathBuf,
        /// Destination directory
        destination: PathBuf,
    },
    /// Recreate a symlink with the identical target string
    CreateSymlink {
        /// Source link
        source: PathBuf,
        /// Target string read from the source link
        target: PathBuf,
        /// Destination link
        destination: PathBuf,
    },
    /// Share the previous snapshot's copy of an unchanged file
    Hardlink {
        /// Source file
        source: PathBuf,
        /// File in the previous snapshot
        previous: PathBuf,
        /// Destination file
        destination: PathBuf,
        /// Captured attributes of the source
        entry: FileEntry,
    },
    /// Copy a new or modified file
    Copy {
        /// Source file
        source: PathBuf,
        /// Destination file
        destination: PathBuf,
        /// Captured attributes of the source
        entry: FileEntry,
        /// Classification that caused the copy
        change: ChangeKind,
    },
    /// Leave an item out
    Skip {
        /// Skipped source path
        source: PathBuf,
        /// Reason for skipping
        reason: SkipReason,
    },
    /// Apply the source directory's timestamps to the destination
    FinishDirectory {
        /// Source directory
        source: PathBuf,
        /// Destination directory
        destination: PathBuf,
    },
}

/// Statistics from one backup walk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    /// Directories created or reused
    pub directories: usize,
    /// Files copied (new or modified)
    pub files_copied: usize,
    /// Files hardlinked to the previous snapshot
    pub files_linked: usize,
    /// Symlinks recreated
    pub symlinks: usize,
    /// Items skipped on purpose
    pub skipped: usize,
    /// Items that failed and were left out
    pub failed: usize,
    /// Bytes written by copies
    pub bytes_copied: u64,
}

impl BackupStats {
    /// Copied plus linked files
    pub fn total_files(&self) -> usize {
        self.files_copied + self.files_linked
    }

    /// Check if any item failed
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Result of sweeping deletion-marked entries
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Entries removed
    pub swept: Vec<String>,
    /// Entries that could not be removed, with the error
    pub failures: Vec<(String, String)>,
}

/// What the retention phase decided and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    /// Marked by bucketed reduction
    pub marked_by_reduction: Vec<String>,
    /// Marked by the keep-days policy
    pub marked_by_age: Vec<String>,
    /// Marked by the max-count policy
    pub marked_by_count: Vec<String>,
    /// Removed to bring volume usage under the threshold
    pub pruned_for_capacity: Vec<String>,
    /// Sweep of all marked entries
    pub sweep: SweepReport,
}

impl RetentionReport {
    /// Total snapshots marked by the three deferred policies
    pub fn total_marked(&self) -> usize {
        self.marked_by_reduction.len() + self.marked_by_age.len() + self.marked_by_count.len()
    }
}

/// Receiver of human-readable progress lines
///
/// Lines look like `Copying: /etc/hosts` or `Deleting: 2012-05-27-120528`.
/// Implemented for every `Fn(&str)` closure.
pub trait OutputSink {
    /// Accept one progress line
    fn line(&self, message: &str);
}

impl<F> OutputSink for F
where
    F: Fn(&str),
{
    fn line(&self, message: &str) {
        self(message)
    }
}

/// Output sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentSink;

impl OutputSink for SilentSink {
    fn line(&self, _message: &str) {}
}

/// Hook callbacks around the phases of a run
///
/// Hooks are side-effecting; nothing they do feeds back into the run.
///
/// # Examples
///
/// ```rust
/// use strata::types::BackupHook;
///
/// struct Announce;
///
/// impl BackupHook for Announce {
///     fn pre_backup(&self) { println!("backup starting"); }
///     fn post_backup(&self) { println!("backup finished"); }
///     fn pre_retention(&self) {}
///     fn post_retention(&self) {}
/// }
/// ```
pub trait BackupHook {
    /// Called after the lock is taken, before anything is written
    fn pre_backup(&self);

    /// Called at the end of a run, including clean early exits and graceful aborts
    fn post_backup(&self);

    /// Called before the retention policies are evaluated
    fn pre_retention(&self);

    /// Called after the sweep
    fn post_retention(&self);
}

/// Default implementation of BackupHook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHook;

impl BackupHook for NoOpHook {
    fn pre_backup(&self) {}

    fn post_backup(&self) {}

    fn pre_retention(&self) {}

    fn post_retention(&self) {}
}
