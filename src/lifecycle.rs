//! Birth, finalization and crash recovery of snapshots
//!
//! A snapshot is written under its in-progress name and renamed to its
//! final name only after the engine has finished. The rename is the single
//! instant at which it becomes a hardlink source and a retention candidate.
//! Leftover in-progress directories from an interrupted run are renamed to
//! the deletion suffix before anything else happens, so at most one
//! incomplete snapshot exists at any time.

use crate::error::{Result, StrataError};
use crate::snapshot::{BackupHome, SnapshotName, SnapshotState};
use crate::utils;
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mode of a fresh snapshot root: owner and group only
pub const SNAPSHOT_MODE: u32 = 0o770;

/// Snapshot state transitions for one backup home
#[derive(Debug, Clone)]
pub struct SnapshotLifecycle {
    home: BackupHome,
    gid: Option<u32>,
}

/// A snapshot directory that has been created but not finalized
#[derive(Debug)]
pub struct InProgressSnapshot {
    name: SnapshotName,
    path: PathBuf,
}

impl InProgressSnapshot {
    /// Name the snapshot will carry once finalized
    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    /// Directory being written
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotLifecycle {
    /// Lifecycle for `home`, assigning new snapshots to group `gid`
    pub fn new(home: BackupHome, gid: Option<u32>) -> Self {
        Self { home, gid }
    }

    /// Backup home this lifecycle manages
    pub fn home(&self) -> &BackupHome {
        &self.home
    }

    /// Mark every in-progress snapshot for deletion
    ///
    /// Nothing is removed here; the retention sweep does that. Returns the
    /// names that were recovered.
    pub fn recover(&self) -> Result<Vec<SnapshotName>> {
        if !self.home.exists() {
            return Ok(Vec::new());
        }

        let partials = self.home.in_progress()?;
        for name in &partials {
            let from = self.home.path_for(name, SnapshotState::InProgress);
            let to = self.home.path_for(name, SnapshotState::MarkedForDeletion);
            if utils::lexists(&to) {
                // A previous recovery of the same name was never swept
                warn!("{:?} already exists, sweeping it first", to);
                self.home.remove_marked(name)?;
            }
            fs::rename(&from, &to)?;
            info!("Interrupted snapshot {} marked for deletion", name);
        }
        Ok(partials)
    }

    /// Create the in-progress directory for a snapshot taken at `now`
    pub fn begin_at(&self, now: NaiveDateTime) -> Result<InProgressSnapshot> {
        let name = SnapshotName::from_datetime(now);
        if utils::lexists(&self.home.snapshot_path(&name)) {
            return Err(StrataError::internal(format!("snapshot {} already exists", name)));
        }
        let path = self.home.path_for(&name, SnapshotState::InProgress);

        fs::create_dir_all(&path)?;
        utils::set_permissions(&path, SNAPSHOT_MODE)?;
        utils::try_set_ownership(&path, Some(nix::unistd::getuid().as_raw()), self.gid);
        debug!("Started snapshot {:?}", path);

        Ok(InProgressSnapshot { name, path })
    }

    /// Create the in-progress directory for a snapshot taken now
    pub fn begin(&self) -> Result<InProgressSnapshot> {
        self.begin_at(chrono::Local::now().naive_local())
    }

    /// Publish a finished snapshot and move `Latest` to it
    pub fn finalize(&self, snapshot: InProgressSnapshot) -> Result<SnapshotName> {
        let complete = self.home.snapshot_path(&snapshot.name);
        fs::rename(&snapshot.path, &complete)?;
        info!("Snapshot {} complete", snapshot.name);

        self.home.update_latest_link()?;
        Ok(snapshot.name)
    }
}
