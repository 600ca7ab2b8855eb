//! Snapshot naming and the snapshot collection of one backup home
//!
//! A backup home lives at `<backupLocation>/Backups.backupdb/<hostName>` and
//! holds one directory per snapshot. The directory name is the creation
//! time in `YYYY-MM-DD-HHMMSS` form, so lexical order is creation order. A
//! suffix carries the state:
//!
//! | Directory name               | State                |
//! |------------------------------|----------------------|
//! | `2012-05-27-120728.part`     | in progress          |
//! | `2012-05-27-120728`          | complete             |
//! | `2012-05-27-120728.delete`   | marked for deletion  |
//!
//! A `Latest` symlink at the root of the backup home names the most recent
//! complete snapshot. It is advisory only.

use crate::error::{Result, StrataError};
use crate::types::{OutputSink, SweepReport};
use crate::utils;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `strftime` pattern of snapshot names
pub const NAME_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Suffix of a snapshot that is still being written
pub const IN_PROGRESS_SUFFIX: &str = ".part";

/// Suffix of a snapshot queued for removal
pub const DELETION_SUFFIX: &str = ".delete";

/// Name of the latest-snapshot pointer
pub const LATEST_LINK: &str = "Latest";

/// Directory on the backup volume that holds every host's backup home
pub const BACKUP_DB_DIR: &str = "Backups.backupdb";

/// Name of the lock file inside a backup home
pub const LOCK_FILE: &str = ".strata.lock";

/// Validated snapshot name
///
/// Ordering follows the name, which is also chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SnapshotName {
    name: String,
    #[serde(skip)]
    timestamp: NaiveDateTime,
}

impl SnapshotName {
    /// Parse a bare snapshot name (no suffix)
    pub fn parse(name: &str) -> Result<Self> {
        if !Self::has_name_shape(name) {
            return Err(StrataError::InvalidSnapshotName(name.to_string()));
        }
        let timestamp = NaiveDateTime::parse_from_str(name, NAME_FORMAT)
            .map_err(|_| StrataError::InvalidSnapshotName(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            timestamp,
        })
    }

    /// Name for a snapshot created at `timestamp` (subseconds dropped)
    pub fn from_datetime(timestamp: NaiveDateTime) -> Self {
        let name = timestamp.format(NAME_FORMAT).to_string();
        // Re-parse so the stored timestamp has whole-second precision
        let timestamp = NaiveDateTime::parse_from_str(&name, NAME_FORMAT).unwrap_or(timestamp);
        Self { name, timestamp }
    }

    /// Name for a snapshot created now, in local time
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// The directory name
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Creation time encoded in the name
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// `^\d{4}-\d{2}-\d{2}-\d{6}$`
    fn has_name_shape(name: &str) -> bool {
        let bytes = name.as_bytes();
        bytes.len() == 17
            && bytes.iter().enumerate().all(|(i, b)| match i {
                4 | 7 | 10 => *b == b'-',
                _ => b.is_ascii_digit(),
            })
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// State of a snapshot directory, carried by its suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Still being written
    InProgress,
    /// Finalized; eligible as hardlink source and retention candidate
    Complete,
    /// Queued for removal by the next sweep
    MarkedForDeletion,
}

impl SnapshotState {
    /// Split a directory name into snapshot name and state
    ///
    /// Returns `None` for anything that is not a snapshot directory.
    pub fn classify(dir_name: &str) -> Option<(SnapshotName, SnapshotState)> {
        let (base, state) = if let Some(base) = dir_name.strip_suffix(IN_PROGRESS_SUFFIX) {
            (base, SnapshotState::InProgress)
        } else if let Some(base) = dir_name.strip_suffix(DELETION_SUFFIX) {
            (base, SnapshotState::MarkedForDeletion)
        } else {
            (dir_name, SnapshotState::Complete)
        };
        SnapshotName::parse(base).ok().map(|name| (name, state))
    }

    /// Suffix appended to the snapshot name for this state
    pub fn suffix(self) -> &'static str {
        match self {
            SnapshotState::InProgress => IN_PROGRESS_SUFFIX,
            SnapshotState::Complete => "",
            SnapshotState::MarkedForDeletion => DELETION_SUFFIX,
        }
    }
}

/// The snapshot collection of one host
#[derive(Debug, Clone)]
pub struct BackupHome {
    path: PathBuf,
}

impl BackupHome {
    /// Use `path` directly as the backup home
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<backup_location>/Backups.backupdb/<host_name>`
    pub fn for_host(backup_location: &Path, host_name: &str) -> Self {
        Self::new(backup_location.join(BACKUP_DB_DIR).join(host_name))
    }

    /// Location of the backup home
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether the backup home directory exists
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Create the backup home if needed
    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Path of the lock file guarding this backup home
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }

    /// Path of the latest-snapshot pointer
    pub fn latest_link(&self) -> PathBuf {
        self.path.join(LATEST_LINK)
    }

    /// Directory of a snapshot in the given state
    pub fn path_for(&self, name: &SnapshotName, state: SnapshotState) -> PathBuf {
        self.path.join(format!("{}{}", name, state.suffix()))
    }

    /// Directory of a complete snapshot
    pub fn snapshot_path(&self, name: &SnapshotName) -> PathBuf {
        self.path_for(name, SnapshotState::Complete)
    }

    /// All snapshot directories with their state, sorted by name
    pub fn entries(&self) -> Result<Vec<(SnapshotName, SnapshotState)>> {
        if !self.exists() {
            return Err(StrataError::BackupHomeMissing(self.path.clone()));
        }

        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(parsed) = SnapshotState::classify(file_name) {
                entries.push(parsed);
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn names_in_state(&self, wanted: SnapshotState) -> Result<Vec<SnapshotName>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, state)| *state == wanted)
            .map(|(name, _)| name)
            .collect())
    }

    /// Complete snapshots, oldest first
    pub fn snapshots(&self) -> Result<Vec<SnapshotName>> {
        self.names_in_state(SnapshotState::Complete)
    }

    /// Snapshots left in progress, normally by an interrupted run
    pub fn in_progress(&self) -> Result<Vec<SnapshotName>> {
        self.names_in_state(SnapshotState::InProgress)
    }

    /// Names of every entry carrying the deletion suffix
    pub fn marked_for_deletion(&self) -> Result<Vec<String>> {
        if !self.exists() {
            return Err(StrataError::BackupHomeMissing(self.path.clone()));
        }

        let mut marked = Vec::new();
        for dir_entry in fs::read_dir(&self.path)? {
            let file_name = dir_entry?.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(DELETION_SUFFIX) {
                marked.push(file_name);
            }
        }
        marked.sort();
        Ok(marked)
    }

    /// Most recent complete snapshot
    pub fn most_recent(&self) -> Result<Option<SnapshotName>> {
        Ok(self.snapshots()?.pop())
    }

    /// Oldest complete snapshot
    pub fn oldest(&self) -> Result<Option<SnapshotName>> {
        Ok(self.snapshots()?.into_iter().next())
    }

    /// Resolve a listing id (index into `snapshots()`) to a name
    pub fn snapshot_by_id(&self, id: usize) -> Result<SnapshotName> {
        self.snapshots()?
            .into_iter()
            .nth(id)
            .ok_or_else(|| StrataError::SnapshotNotFound(format!("id {}", id)))
    }

    /// Snapshot the latest pointer names, if the pointer exists
    pub fn latest(&self) -> Result<Option<SnapshotName>> {
        let link = self.latest_link();
        if !utils::lexists(&link) {
            return Ok(None);
        }
        let target = utils::read_symlink(&link)?;
        let target = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StrataError::InvalidSnapshotName(target.display().to_string()))?;
        SnapshotName::parse(target).map(Some)
    }

    /// Point `Latest` at the most recent complete snapshot
    ///
    /// The old pointer is removed first; the window without a pointer is
    /// harmless because nothing relies on it for correctness. With no
    /// complete snapshot left the pointer is simply removed.
    pub fn update_latest_link(&self) -> Result<Option<SnapshotName>> {
        let link = self.latest_link();
        if utils::lexists(&link) {
            fs::remove_file(&link)?;
        }

        let most_recent = self.most_recent()?;
        if let Some(name) = &most_recent {
            utils::create_symlink(Path::new(name.as_str()), &link)?;
            debug!("Latest now points at {}", name);
        }
        Ok(most_recent)
    }

    /// Rename a complete snapshot so the next sweep removes it
    pub fn mark_for_deletion(&self, name: &SnapshotName) -> Result<PathBuf> {
        let from = self.snapshot_path(name);
        if !from.is_dir() {
            return Err(StrataError::SnapshotNotFound(name.to_string()));
        }
        let to = self.path_for(name, SnapshotState::MarkedForDeletion);
        fs::rename(&from, &to)?;
        debug!("Marked {} for deletion", name);
        Ok(to)
    }

    /// Remove every deletion-marked entry
    ///
    /// One failing entry does not stop the rest; failures are collected in
    /// the report.
    pub fn sweep(&self, sink: &dyn OutputSink) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for marked in self.marked_for_deletion()? {
            sink.line(&format!("Deleting: {}", marked));
            match remove_entry(&self.path.join(&marked)) {
                Ok(()) => report.swept.push(marked),
                Err(e) => {
                    warn!("Failed to delete {}: {}", marked, e);
                    report.failures.push((marked, e.to_string()));
                }
            }
        }

        if !report.swept.is_empty() {
            info!("Swept {} marked snapshot(s)", report.swept.len());
        }
        Ok(report)
    }

    /// Remove the deletion-marked entry for `name`, if there is one
    pub(crate) fn remove_marked(&self, name: &SnapshotName) -> Result<()> {
        let marked = self.path_for(name, SnapshotState::MarkedForDeletion);
        if utils::lexists(&marked) {
            remove_entry(&marked)?;
            debug!("Removed stale {:?}", marked);
        }
        Ok(())
    }

    /// Remove one complete snapshot right away
    ///
    /// The snapshot is marked first and then removed, so a crash in between
    /// leaves an entry the next sweep cleans up. When the removed snapshot
    /// was the one `Latest` pointed at, the pointer moves to the most recent
    /// remaining snapshot.
    pub fn delete_snapshot(&self, name: &SnapshotName) -> Result<()> {
        let was_latest = self.latest().ok().flatten().as_ref() == Some(name);
        let marked = self.mark_for_deletion(name)?;
        remove_entry(&marked)?;
        info!("Deleted snapshot {}", name);

        if was_latest {
            self.update_latest_link()?;
        }
        Ok(())
    }
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Register a backup location as a backup device
///
/// Creates `<backup_location>/Backups.backupdb` with mode 0770 and assigns
/// it, best-effort, to the current user and the given group.
pub fn register_backup_location(backup_location: &Path, gid: Option<u32>) -> Result<PathBuf> {
    if !backup_location.is_dir() {
        return Err(StrataError::validation(format!(
            "There is no backup location at {:?} to be registered",
            backup_location
        )));
    }

    let backup_db = backup_location.join(BACKUP_DB_DIR);
    if backup_db.exists() {
        return Err(StrataError::AlreadyRegistered(backup_location.to_path_buf()));
    }

    fs::create_dir(&backup_db)?;
    utils::set_permissions(&backup_db, 0o770)?;
    utils::try_set_ownership(&backup_db, Some(nix::unistd::getuid().as_raw()), gid);
    info!("Registered backup location {:?}", backup_location);
    Ok(backup_db)
}

/// Check whether a backup location has been registered
pub fn is_registered(backup_location: &Path) -> bool {
    backup_location.join(BACKUP_DB_DIR).is_dir()
}
