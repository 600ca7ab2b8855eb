//! Backup engine
//!
//! Replicates a source tree into a snapshot directory, sharing unchanged
//! files with the previous snapshot through hardlinks.
//!
//! The work is split in two:
//!
//! - [`BackupEngine::plan`] walks the source and decides, emitting one
//!   [`BackupAction`] per step. It never writes.
//! - [`ActionApplier`] performs actions and keeps the statistics.
//!
//! Directories are finished in post-order: a directory's timestamps are
//! applied only after every child has been written, since creating a child
//! would otherwise bump them again.
//!
//! ## Failure policy
//!
//! A single unreadable or uncopyable item is logged, counted as failed and
//! left out. Failing to create directory structure, or any write that
//! reports a full, over-quota or read-only volume, aborts the whole run.
//!
//! ```rust,no_run
//! use strata::engine::BackupEngine;
//! use strata::filter::IgnoreRules;
//! use strata::types::SilentSink;
//! use std::path::Path;
//!
//! # fn example() -> strata::Result<()> {
//! let rules = IgnoreRules::new(Path::new("/home"), &["*.tmp".to_string()])?;
//! let engine = BackupEngine::new(rules).with_max_file_size(512 * 1024 * 1024);
//! let stats = engine.run(
//!     Path::new("/home"),
//!     Some(Path::new("/mnt/backup/Backups.backupdb/host/2012-05-26-180728")),
//!     Path::new("/mnt/backup/Backups.backupdb/host/2012-05-27-120728.part"),
//!     &SilentSink,
//! )?;
//! println!("{} copied, {} linked", stats.files_copied, stats.files_linked);
//! # Ok(())
//! # }
//! ```

use crate::classifier;
use crate::error::{Result, StrataError};
use crate::filter::IgnoreRules;
use crate::types::{
    BackupAction, BackupStats, ChangeKind, EntryKind, FileEntry, OutputSink, SkipReason,
};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Tree replication driven by the change classifier
#[derive(Debug)]
pub struct BackupEngine {
    rules: IgnoreRules,
    max_file_size: u64,
}

/// Directory whose children are still being walked
struct OpenDirectory {
    source: PathBuf,
    destination: PathBuf,
    depth: usize,
}

impl BackupEngine {
    /// Engine applying `rules`, without a size limit
    pub fn new(rules: IgnoreRules) -> Self {
        Self {
            rules,
            max_file_size: 0,
        }
    }

    /// Skip regular files larger than `bytes` (0 = unlimited)
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Walk `source` and emit the actions that build `destination`
    ///
    /// `previous` is the root of the previous complete snapshot, if any.
    /// Actions come in walk order, children sorted by name, and every
    /// [`BackupAction::FinishDirectory`] follows the actions of all the
    /// directory's descendants. The walk stops at the first error returned
    /// by `emit`.
    ///
    /// # Errors
    ///
    /// Fails when the source root itself can't be read, or when `emit`
    /// fails.
    pub fn plan<F>(
        &self,
        source: &Path,
        previous: Option<&Path>,
        destination: &Path,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(BackupAction) -> Result<()>,
    {
        let mut open: Vec<OpenDirectory> = Vec::new();
        let mut walker = WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    emit(BackupAction::Skip {
                        source: path,
                        reason: SkipReason::Unreadable(e.to_string()),
                    })?;
                    continue;
                }
            };

            // Close directories this entry is no longer inside of
            while open.last().is_some_and(|dir| dir.depth >= entry.depth()) {
                if let Some(dir) = open.pop() {
                    emit(BackupAction::FinishDirectory {
                        source: dir.source,
                        destination: dir.destination,
                    })?;
                }
            }

            let path = entry.path();
            let relative = path.strip_prefix(source).unwrap_or(path);
            let target = if relative.as_os_str().is_empty() {
                destination.to_path_buf()
            } else {
                destination.join(relative)
            };
            let kind = EntryKind::from_file_type(entry.file_type());

            if entry.depth() > 0 && self.rules.is_ignored(path, kind == EntryKind::Directory) {
                if kind == EntryKind::Directory {
                    walker.skip_current_dir();
                }
                emit(BackupAction::Skip {
                    source: path.to_path_buf(),
                    reason: SkipReason::Ignored,
                })?;
                continue;
            }

            match kind {
                EntryKind::Directory => {
                    emit(BackupAction::CreateDirectory {
                        source: path.to_path_buf(),
                        destination: target.clone(),
                    })?;
                    open.push(OpenDirectory {
                        source: path.to_path_buf(),
                        destination: target,
                        depth: entry.depth(),
                    });
                }
                EntryKind::Symlink => {
                    let action = match fs::read_link(path) {
                        Ok(link_target) => BackupAction::CreateSymlink {
                            source: path.to_path_buf(),
                            target: link_target,
                            destination: target,
                        },
                        Err(e) => BackupAction::Skip {
                            source: path.to_path_buf(),
                            reason: SkipReason::Unreadable(e.to_string()),
                        },
                    };
                    emit(action)?;
                }
                EntryKind::File => {
                    let action = match entry.metadata() {
                        Ok(metadata) => {
                            let file = FileEntry::from_metadata(relative.to_path_buf(), &metadata);
                            self.plan_file(path, previous, target, file)
                        }
                        Err(e) => BackupAction::Skip {
                            source: path.to_path_buf(),
                            reason: SkipReason::Unreadable(e.to_string()),
                        },
                    };
                    emit(action)?;
                }
                EntryKind::Special => {
                    emit(BackupAction::Skip {
                        source: path.to_path_buf(),
                        reason: SkipReason::SpecialFile,
                    })?;
                }
            }
        }

        while let Some(dir) = open.pop() {
            emit(BackupAction::FinishDirectory {
                source: dir.source,
                destination: dir.destination,
            })?;
        }
        Ok(())
    }

    fn plan_file(
        &self,
        source: &Path,
        previous: Option<&Path>,
        destination: PathBuf,
        entry: FileEntry,
    ) -> BackupAction {
        if self.max_file_size > 0 && entry.size > self.max_file_size {
            return BackupAction::Skip {
                source: source.to_path_buf(),
                reason: SkipReason::TooLarge {
                    size: entry.size,
                    limit: self.max_file_size,
                },
            };
        }

        let Some(previous_root) = previous else {
            return BackupAction::Copy {
                source: source.to_path_buf(),
                destination,
                entry,
                change: ChangeKind::New,
            };
        };

        let previous = previous_root.join(&entry.path);
        let change = match classifier::classify(&entry, &previous) {
            Ok(change) => change,
            Err(e) => {
                warn!("Unable to compare {:?} with {:?}, copying: {}", source, previous, e);
                ChangeKind::Modified
            }
        };

        match change {
            ChangeKind::Unchanged => BackupAction::Hardlink {
                source: source.to_path_buf(),
                previous,
                destination,
                entry,
            },
            change => BackupAction::Copy {
                source: source.to_path_buf(),
                destination,
                entry,
                change,
            },
        }
    }

    /// Replicate `source` into `destination`
    ///
    /// `destination` normally exists already (the in-progress snapshot
    /// root); its mode and owner are left alone.
    pub fn run(
        &self,
        source: &Path,
        previous: Option<&Path>,
        destination: &Path,
        sink: &dyn OutputSink,
    ) -> Result<BackupStats> {
        let start = Instant::now();
        info!(
            "Backing up {:?} into {:?} (previous: {:?})",
            source, destination, previous
        );

        let mut applier = ActionApplier::new(sink);
        self.plan(source, previous, destination, |action| applier.apply(action))?;
        let stats = applier.into_stats();

        info!(
            "Backup walk finished in {:?}: {} copied ({}), {} linked, {} skipped, {} failed",
            start.elapsed(),
            stats.files_copied,
            utils::format_bytes(stats.bytes_copied),
            stats.files_linked,
            stats.skipped,
            stats.failed
        );
        Ok(stats)
    }
}

/// Performs [`BackupAction`]s and tallies the outcome
pub struct ActionApplier<'a> {
    sink: &'a dyn OutputSink,
    stats: BackupStats,
    // Directories created by this applier and not yet finished, innermost last
    created: Vec<PathBuf>,
}

impl<'a> ActionApplier<'a> {
    /// Applier reporting progress lines to `sink`
    pub fn new(sink: &'a dyn OutputSink) -> Self {
        Self {
            sink,
            stats: BackupStats::default(),
            created: Vec::new(),
        }
    }

    /// Statistics so far
    pub fn stats(&self) -> &BackupStats {
        &self.stats
    }

    /// Finish and hand back the statistics
    pub fn into_stats(self) -> BackupStats {
        self.stats
    }

    /// Perform one action
    ///
    /// Returns an error only for failures that must abort the run.
    pub fn apply(&mut self, action: BackupAction) -> Result<()> {
        match action {
            BackupAction::CreateDirectory {
                source,
                destination,
            } => self.create_directory(&source, &destination),
            BackupAction::CreateSymlink {
                source,
                target,
                destination,
            } => match utils::create_symlink(&target, &destination) {
                Ok(()) => {
                    trace!("Linked {:?} -> {:?}", destination, target);
                    self.stats.symlinks += 1;
                    Ok(())
                }
                Err(e) => self.tolerate(&source, "recreate symlink", e),
            },
            BackupAction::Hardlink {
                source,
                previous,
                destination,
                entry,
            } => {
                match fs::hard_link(&previous, &destination) {
                    Ok(()) => {
                        self.sink.line(&format!("Linking: {}", source.display()));
                        self.stats.files_linked += 1;
                        Ok(())
                    }
                    Err(e) if utils::is_volume_failure(&e) => Err(e.into()),
                    Err(e) => {
                        warn!("Unable to link {:?}, copying instead: {}", previous, e);
                        self.sink.line(&format!("Copying: {}", source.display()));
                        self.copy(&source, &destination, &entry)
                    }
                }
            }
            BackupAction::Copy {
                source,
                destination,
                entry,
                change,
            } => {
                self.sink.line(&format!("Copying: {}", source.display()));
                trace!("{:?} is {:?}", source, change);
                self.copy(&source, &destination, &entry)
            }
            BackupAction::Skip { source, reason } => {
                match reason {
                    SkipReason::Ignored => {
                        self.sink.line(&format!("Ignore: {}", source.display()));
                        self.stats.skipped += 1;
                    }
                    SkipReason::TooLarge { size, limit } => {
                        self.sink.line(&format!("Ignore: {}", source.display()));
                        debug!("{:?} is {} bytes, over the {} byte limit", source, size, limit);
                        self.stats.skipped += 1;
                    }
                    SkipReason::SpecialFile => {
                        debug!("Skipping special file {:?}", source);
                        self.stats.skipped += 1;
                    }
                    SkipReason::Unreadable(message) => {
                        warn!("Skipping unreadable {:?}: {}", source, message);
                        self.stats.failed += 1;
                    }
                }
                Ok(())
            }
            BackupAction::FinishDirectory {
                source,
                destination,
            } => {
                let created = self.created.last() == Some(&destination);
                if created {
                    self.created.pop();
                }
                let stamped = fs::symlink_metadata(&source)
                    .map_err(StrataError::from)
                    .and_then(|metadata| {
                        if created {
                            utils::set_permissions(&destination, utils::get_permissions(&metadata))?;
                        }
                        utils::copy_timestamps(&metadata, &destination)
                    });
                match stamped {
                    Ok(()) => Ok(()),
                    Err(e) => self.tolerate(&source, "set directory times", e),
                }
            }
        }
    }

    fn create_directory(&mut self, source: &Path, destination: &Path) -> Result<()> {
        if utils::lexists(destination) {
            self.stats.directories += 1;
            return Ok(());
        }

        // Structure failures are fatal
        fs::create_dir(destination)?;
        self.stats.directories += 1;
        self.created.push(destination.to_path_buf());

        // Owner keeps write access until the directory is finished, or a
        // read-only source directory could not receive its children
        match fs::symlink_metadata(source) {
            Ok(metadata) => {
                utils::copy_ownership(&metadata, destination);
                let mode = utils::get_permissions(&metadata) | 0o700;
                if let Err(e) = utils::set_permissions(destination, mode) {
                    warn!("Unable to set mode on {:?}: {}", destination, e);
                }
            }
            Err(e) => warn!("Unable to read {:?}, keeping default mode: {}", source, e),
        }
        Ok(())
    }

    fn copy(&mut self, source: &Path, destination: &Path, entry: &FileEntry) -> Result<()> {
        match utils::copy_file_with_metadata(source, destination) {
            Ok(bytes) => {
                self.stats.files_copied += 1;
                self.stats.bytes_copied += bytes;
                if bytes != entry.size {
                    debug!("{:?} changed size during the copy", source);
                }
                Ok(())
            }
            Err(e) => {
                if utils::lexists(destination) {
                    let _ = fs::remove_file(destination);
                }
                self.tolerate(source, "copy", e)
            }
        }
    }

    /// Count a per-item failure, unless the volume itself is failing
    fn tolerate(&mut self, source: &Path, operation: &str, error: StrataError) -> Result<()> {
        if let StrataError::Io(io) = &error {
            if utils::is_volume_failure(io) {
                return Err(error);
            }
        }
        warn!("Failed to {} {:?}: {}", operation, source, error);
        self.stats.failed += 1;
        Ok(())
    }
}
