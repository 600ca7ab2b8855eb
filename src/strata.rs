//! Main Strata implementation
//!
//! [`Strata`] drives a complete backup run against one backup home:
//!
//! 1. validate the configuration and check the backup location is registered
//! 2. take the lock
//! 3. fire the pre-backup hooks
//! 4. mark interrupted snapshots for deletion
//! 5. replicate the source root into a new in-progress snapshot, linking
//!    against the most recent complete snapshot
//! 6. finalize the snapshot and move `Latest`
//! 7. apply retention between the pre- and post-retention hooks
//! 8. fire the post-backup hooks and release the lock
//!
//! The post-backup hooks fire, and the lock is released, on every exit
//! path once the lock is held. A fatal error during the walk leaves the
//! in-progress snapshot for the next run to recover; retention is skipped.

use crate::config::StrataConfig;
use crate::engine::BackupEngine;
use crate::error::{Result, StrataError};
use crate::filter::IgnoreRules;
use crate::hooks::ScriptHooks;
use crate::lifecycle::SnapshotLifecycle;
use crate::lock::{LockFile, LockGuard, ProcessProbe, SystemProbe};
use crate::retention::{RetentionEngine, StatvfsProbe, UsageProbe};
use crate::snapshot::{self, BackupHome, SnapshotName};
use crate::types::{BackupHook, BackupStats, OutputSink, RetentionReport, SilentSink, SweepReport};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// What one backup run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The snapshot created
    pub snapshot: SnapshotName,
    /// Snapshot unchanged files were linked against
    pub previous: Option<SnapshotName>,
    /// Walk statistics
    pub stats: BackupStats,
    /// Interrupted snapshots marked for deletion at the start of the run
    pub recovered: Vec<String>,
    /// Retention decisions and removals
    pub retention: RetentionReport,
    /// Wall-clock time of the run
    pub elapsed: Duration,
}

/// Snapshot manager for one source root and backup home
pub struct Strata {
    config: StrataConfig,
    hooks: Box<dyn BackupHook>,
    process_probe: Box<dyn ProcessProbe>,
    usage_probe: Box<dyn UsageProbe>,
    sink: Box<dyn OutputSink>,
}

impl std::fmt::Debug for Strata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strata")
            .field("config", &self.config)
            .field("hooks", &"<dyn BackupHook>")
            .finish_non_exhaustive()
    }
}

impl Strata {
    /// Strata running the configured hook scripts, probing the real system
    /// and printing nothing
    pub fn new(config: StrataConfig) -> Self {
        StrataBuilder::from_config(config).build()
    }

    /// Configuration in use
    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Backup home of the configured host
    pub fn home(&self) -> Result<BackupHome> {
        self.config.backup_home()
    }

    /// Run a backup now
    pub fn run(&self) -> Result<RunReport> {
        self.run_at(Local::now().naive_local())
    }

    /// Run a backup as if the clock read `now`
    ///
    /// `now` names the snapshot and is the reference point for retention
    /// ages.
    #[instrument(skip(self), fields(host = %self.config.host_name))]
    pub fn run_at(&self, now: NaiveDateTime) -> Result<RunReport> {
        let start = Instant::now();
        self.config.validate()?;
        let home = self.registered_home()?;
        let gid = self.config.group_id()?;
        let root = fs::canonicalize(&self.config.root)?;
        let rules = self.ignore_rules(&root)?;

        home.ensure_exists()?;
        let guard = self.lock(&home)?;

        self.hooks.pre_backup();
        let result = self.backup_locked(&home, &root, rules, gid, now, start);
        self.hooks.post_backup();

        drop(guard);
        result
    }

    fn backup_locked(
        &self,
        home: &BackupHome,
        root: &Path,
        rules: IgnoreRules,
        gid: u32,
        now: NaiveDateTime,
        start: Instant,
    ) -> Result<RunReport> {
        let lifecycle = SnapshotLifecycle::new(home.clone(), Some(gid));
        let recovered = lifecycle.recover()?;

        // The newest complete snapshot, never the Latest pointer
        let previous = home.most_recent()?;
        let previous_path = previous.as_ref().map(|name| home.snapshot_path(name));

        let in_progress = lifecycle.begin_at(now)?;
        let engine = BackupEngine::new(rules).with_max_file_size(self.config.max_file_size_bytes());
        let stats = engine.run(
            root,
            previous_path.as_deref(),
            in_progress.path(),
            self.sink.as_ref(),
        )?;
        let snapshot = lifecycle.finalize(in_progress)?;

        self.hooks.pre_retention();
        let retention = RetentionEngine::with_probe(
            home.clone(),
            self.config.retention_policy(),
            self.usage_probe.as_ref(),
        )
        .run(now, self.sink.as_ref());
        self.hooks.post_retention();

        let report = RunReport {
            snapshot,
            previous,
            stats,
            recovered: recovered.iter().map(|name| name.to_string()).collect(),
            retention: retention?,
            elapsed: start.elapsed(),
        };
        info!(
            "Backup {} finished in {:?}: {} files copied, {} linked",
            report.snapshot,
            report.elapsed,
            report.stats.files_copied,
            report.stats.files_linked
        );
        Ok(report)
    }

    /// Sweep everything marked for deletion, without taking a snapshot
    ///
    /// Interrupted snapshots are marked first, so they are swept too.
    pub fn clean(&self) -> Result<SweepReport> {
        let home = self.registered_home()?;
        home.ensure_exists()?;
        let _guard = self.lock(&home)?;

        self.hooks.pre_backup();
        let result = SnapshotLifecycle::new(home.clone(), None)
            .recover()
            .and_then(|_| home.sweep(self.sink.as_ref()));
        self.hooks.post_backup();
        result
    }

    /// Delete the oldest complete snapshot, without taking a snapshot
    pub fn delete_oldest(&self) -> Result<SnapshotName> {
        let home = self.registered_home()?;
        if !home.exists() {
            return Err(StrataError::NoSnapshots);
        }
        let _guard = self.lock(&home)?;

        self.hooks.pre_backup();
        let result = home.oldest().and_then(|oldest| {
            let oldest = oldest.ok_or(StrataError::NoSnapshots)?;
            self.sink.line(&format!("Deleting: {}", oldest));
            home.delete_snapshot(&oldest)?;
            Ok(oldest)
        });
        self.hooks.post_backup();
        result
    }

    /// Register the configured backup location as a backup device
    pub fn register(&self) -> Result<PathBuf> {
        let location = self.config.backup_location()?;
        snapshot::register_backup_location(location, Some(self.config.group_id()?))
    }

    /// Complete snapshots of the configured host, oldest first
    pub fn snapshots(&self) -> Result<Vec<SnapshotName>> {
        self.home()?.snapshots()
    }

    fn registered_home(&self) -> Result<BackupHome> {
        let location = self.config.backup_location()?;
        if !snapshot::is_registered(location) {
            return Err(StrataError::NotRegistered(location.to_path_buf()));
        }
        self.home()
    }

    fn lock(&self, home: &BackupHome) -> Result<LockGuard> {
        LockFile::with_probe(home.lock_path(), self.process_probe.as_ref()).acquire()
    }

    /// Ignore rules for the canonical source root, excluding the backup
    /// location when it lies inside the root
    fn ignore_rules(&self, root: &Path) -> Result<IgnoreRules> {
        let mut rules = IgnoreRules::new(root, &self.config.ignore)?;
        let location = fs::canonicalize(self.config.backup_location()?)?;
        if location == root {
            rules = rules.exclude(location.join(snapshot::BACKUP_DB_DIR));
        } else if location.starts_with(root) {
            debug!("Excluding backup location {:?} from the walk", location);
            rules = rules.exclude(location);
        }
        Ok(rules)
    }
}

/// Builder for [`Strata`]
///
/// # Examples
///
/// ```rust,no_run
/// use strata::StrataBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let strata = StrataBuilder::new()
///     .root("/home")
///     .backup_location("/mnt/backup")
///     .host_name("workstation")
///     .ignore_patterns(vec!["*.tmp".to_string(), ".cache/".to_string()])
///     .max_images(30)
///     .reduce_backups(true)
///     .build();
/// let report = strata.run()?;
/// println!("Created {}", report.snapshot);
/// # Ok(())
/// # }
/// ```
pub struct StrataBuilder {
    config: StrataConfig,
    hooks: Option<Box<dyn BackupHook>>,
    process_probe: Box<dyn ProcessProbe>,
    usage_probe: Box<dyn UsageProbe>,
    sink: Box<dyn OutputSink>,
}

impl StrataBuilder {
    /// Builder starting from the default configuration
    pub fn new() -> Self {
        Self::from_config(StrataConfig::default())
    }

    /// Builder starting from `config`
    pub fn from_config(config: StrataConfig) -> Self {
        Self {
            config,
            hooks: None,
            process_probe: Box::new(SystemProbe),
            usage_probe: Box::new(StatvfsProbe),
            sink: Box::new(SilentSink),
        }
    }

    /// Source root to back up
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Mount point of the backup volume
    pub fn backup_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.config.backup_location = Some(location.into());
        self
    }

    /// Host name the backup home is named after
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.config.host_name = host_name.into();
        self
    }

    /// Gitignore-style patterns to leave out
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore = patterns;
        self
    }

    /// Skip files larger than this many MiB (0 = unlimited)
    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_mb = mb;
        self
    }

    /// Keep at most this many snapshots (0 = unlimited)
    pub fn max_images(mut self, count: usize) -> Self {
        self.config.max_images = count;
        self
    }

    /// Remove snapshots older than this many days (0 = never)
    pub fn keep_days(mut self, days: u32) -> Self {
        self.config.keep_days = days;
        self
    }

    /// Prune while the backup volume is fuller than this (0 = never)
    pub fn drive_percentage(mut self, percent: u8) -> Self {
        self.config.drive_percentage = percent;
        self
    }

    /// Thin snapshots out to daily and weekly
    pub fn reduce_backups(mut self, reduce: bool) -> Self {
        self.config.reduce_backups = reduce;
        self
    }

    /// Group owner of new snapshots
    pub fn backup_group(mut self, gid: u32) -> Self {
        self.config.backup_group = Some(crate::config::GroupSpec::Id(gid));
        self
    }

    /// Replace the hook scripts from the configuration
    pub fn hooks(mut self, hooks: Box<dyn BackupHook>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Liveness probe for the lock
    pub fn process_probe(mut self, probe: Box<dyn ProcessProbe>) -> Self {
        self.process_probe = probe;
        self
    }

    /// Usage probe for capacity pruning
    pub fn usage_probe(mut self, probe: Box<dyn UsageProbe>) -> Self {
        self.usage_probe = probe;
        self
    }

    /// Receiver of progress lines
    pub fn output_sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Finish building
    pub fn build(self) -> Strata {
        let hooks = self.hooks.unwrap_or_else(|| {
            Box::new(
                ScriptHooks::new()
                    .pre_backup_dir(self.config.pre_backup_hooks.clone())
                    .post_backup_dir(self.config.post_backup_hooks.clone())
                    .pre_retention_dir(self.config.pre_retention_hooks.clone())
                    .post_retention_dir(self.config.post_retention_hooks.clone()),
            )
        });
        Strata {
            config: self.config,
            hooks,
            process_probe: self.process_probe,
            usage_probe: self.usage_probe,
            sink: self.sink,
        }
    }
}

impl Default for StrataBuilder {
    fn default() -> Self {
        Self::new()
    }
}
