//! Retention engine
//!
//! Decides which complete snapshots to remove and removes them. Four
//! policies exist:
//!
//! - **Bucketed reduction**: snapshots are grouped by age into today
//!   (under one day), daily (one to thirty-one days) and weekly buckets.
//!   Today is left alone. Daily keeps the newest snapshot of each calendar
//!   day. Weekly keeps one snapshot per rolling seven-day window anchored
//!   at the oldest snapshot.
//! - **Keep days**: snapshots older than the threshold are removed.
//! - **Max count**: only the newest N snapshots are kept.
//! - **Capacity**: while the backup volume is fuller than the threshold,
//!   the oldest snapshot is removed, but never the last one.
//!
//! The first three are planned together against one listing and executed
//! in two phases: every choice is marked with the deletion suffix, then the
//! marked entries are swept. Capacity pruning runs afterwards because usage
//! has to be measured again after each removal. A threshold of zero
//! disables a policy.

use crate::error::{Result, StrataError};
use crate::snapshot::{BackupHome, SnapshotName};
use crate::types::{OutputSink, RetentionReport};
use chrono::{NaiveDateTime, TimeDelta};
use nix::sys::statvfs::statvfs;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Age class of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetentionBucket {
    /// Younger than one day, including snapshots dated in the future
    Today,
    /// At least one day and less than thirty-one days old
    Daily,
    /// Thirty-one days or older
    Weekly,
}

impl RetentionBucket {
    /// Bucket for a snapshot of the given age
    pub fn for_age(age: TimeDelta) -> Self {
        if age < TimeDelta::days(1) {
            RetentionBucket::Today
        } else if age < TimeDelta::days(31) {
            RetentionBucket::Daily
        } else {
            RetentionBucket::Weekly
        }
    }

    /// Bucket of `snapshot` as seen at `now`
    pub fn of(snapshot: &SnapshotName, now: NaiveDateTime) -> Self {
        Self::for_age(now - snapshot.timestamp())
    }
}

/// Snapshots split by age class, each oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    /// Under one day old
    pub today: Vec<SnapshotName>,
    /// One to thirty-one days old
    pub daily: Vec<SnapshotName>,
    /// Thirty-one days or older
    pub weekly: Vec<SnapshotName>,
}

/// Sort snapshots into age buckets
pub fn categorize(snapshots: &[SnapshotName], now: NaiveDateTime) -> Buckets {
    let mut sorted = snapshots.to_vec();
    sorted.sort();

    let mut buckets = Buckets::default();
    for snapshot in sorted {
        match RetentionBucket::of(&snapshot, now) {
            RetentionBucket::Today => buckets.today.push(snapshot),
            RetentionBucket::Daily => buckets.daily.push(snapshot),
            RetentionBucket::Weekly => buckets.weekly.push(snapshot),
        }
    }
    buckets
}

/// Daily-bucket snapshots that share a calendar day with a newer one
pub fn extra_daily(daily: &[SnapshotName]) -> Vec<SnapshotName> {
    let mut sorted = daily.to_vec();
    sorted.sort();

    let mut extra = Vec::new();
    let mut newer_day = None;
    for snapshot in sorted.into_iter().rev() {
        let day = snapshot.timestamp().date();
        if newer_day == Some(day) {
            extra.push(snapshot);
        }
        newer_day = Some(day);
    }
    extra.reverse();
    extra
}

/// Weekly-bucket snapshots that fall within seven days of the current anchor
///
/// The oldest snapshot is the first anchor; the first one outside the
/// window becomes the next.
pub fn extra_weekly(weekly: &[SnapshotName]) -> Vec<SnapshotName> {
    let mut sorted = weekly.to_vec();
    sorted.sort();

    let mut extra = Vec::new();
    let mut anchor = None;
    for snapshot in sorted {
        let day = snapshot.timestamp().date();
        match anchor {
            Some(anchor_day) if day - anchor_day < TimeDelta::days(7) => extra.push(snapshot),
            _ => anchor = Some(day),
        }
    }
    extra
}

/// Snapshots more than `keep_days` days old; none when `keep_days` is 0
pub fn older_than(snapshots: &[SnapshotName], keep_days: u32, now: NaiveDateTime) -> Vec<SnapshotName> {
    if keep_days == 0 {
        return Vec::new();
    }
    let limit = TimeDelta::days(i64::from(keep_days));
    let mut old: Vec<SnapshotName> = snapshots
        .iter()
        .filter(|s| now - s.timestamp() > limit)
        .cloned()
        .collect();
    old.sort();
    old
}

/// The oldest snapshots beyond the newest `max_count`; none when `max_count` is 0
pub fn over_max_count(snapshots: &[SnapshotName], max_count: usize) -> Vec<SnapshotName> {
    if max_count == 0 || snapshots.len() <= max_count {
        return Vec::new();
    }
    let mut sorted = snapshots.to_vec();
    sorted.sort();
    sorted.truncate(sorted.len() - max_count);
    sorted
}

/// Source of backup volume usage
pub trait UsageProbe {
    /// Used space of the volume holding `path`, as a whole percentage
    fn usage_percent(&self, path: &Path) -> Result<u8>;
}

impl<P: UsageProbe + ?Sized> UsageProbe for &P {
    fn usage_percent(&self, path: &Path) -> Result<u8> {
        (**self).usage_percent(path)
    }
}

impl<P: UsageProbe + ?Sized> UsageProbe for Box<P> {
    fn usage_percent(&self, path: &Path) -> Result<u8> {
        (**self).usage_percent(path)
    }
}

/// Usage probe backed by `statvfs`
///
/// Usage is `100 - floor(available / total * 100)`, with available counting
/// blocks free to unprivileged users.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl UsageProbe for StatvfsProbe {
    fn usage_percent(&self, path: &Path) -> Result<u8> {
        let stats = statvfs(path).map_err(|e| StrataError::DiskUsage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(usage_from_blocks(stats.blocks_available() as u64, stats.blocks() as u64))
    }
}

fn usage_from_blocks(available: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let free = (u128::from(available.min(total)) * 100 / u128::from(total)) as u8;
    100 - free
}

/// Thresholds for the retention policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    /// Run bucketed reduction
    pub reduce_backups: bool,
    /// Remove snapshots older than this many days (0 = off)
    pub keep_days: u32,
    /// Keep at most this many snapshots (0 = off)
    pub max_images: usize,
    /// Prune while volume usage exceeds this percentage (0 = off)
    pub drive_percentage: u8,
}

/// What the deferred policies chose, per policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Redundant within their bucket
    pub reduction: Vec<SnapshotName>,
    /// Past the keep-days threshold
    pub age: Vec<SnapshotName>,
    /// Beyond the max count
    pub count: Vec<SnapshotName>,
}

impl RetentionPlan {
    /// Every snapshot chosen, oldest first
    pub fn all(&self) -> Vec<SnapshotName> {
        let mut all: Vec<SnapshotName> = self
            .reduction
            .iter()
            .chain(&self.age)
            .chain(&self.count)
            .cloned()
            .collect();
        all.sort();
        all
    }

    /// Check whether nothing was chosen
    pub fn is_empty(&self) -> bool {
        self.reduction.is_empty() && self.age.is_empty() && self.count.is_empty()
    }
}

impl RetentionPolicy {
    /// Choose snapshots to remove from `snapshots` as of `now`
    ///
    /// Reduction runs first; keep-days sees what reduction kept, and max
    /// count sees what both kept. No snapshot is chosen twice.
    pub fn plan(&self, snapshots: &[SnapshotName], now: NaiveDateTime) -> RetentionPlan {
        let mut plan = RetentionPlan::default();
        let mut survivors = snapshots.to_vec();
        survivors.sort();
        survivors.dedup();

        if self.reduce_backups {
            let buckets = categorize(&survivors, now);
            plan.reduction = extra_daily(&buckets.daily);
            plan.reduction.extend(extra_weekly(&buckets.weekly));
            plan.reduction.sort();
            survivors.retain(|s| !plan.reduction.contains(s));
        }

        plan.age = older_than(&survivors, self.keep_days, now);
        survivors.retain(|s| !plan.age.contains(s));

        plan.count = over_max_count(&survivors, self.max_images);
        plan
    }
}

/// Applies a [`RetentionPolicy`] to one backup home
pub struct RetentionEngine<U = StatvfsProbe> {
    home: BackupHome,
    policy: RetentionPolicy,
    probe: U,
}

impl RetentionEngine<StatvfsProbe> {
    /// Engine measuring usage with `statvfs`
    pub fn new(home: BackupHome, policy: RetentionPolicy) -> Self {
        Self::with_probe(home, policy, StatvfsProbe)
    }
}

impl<U: UsageProbe> RetentionEngine<U> {
    /// Engine with a custom usage probe
    pub fn with_probe(home: BackupHome, policy: RetentionPolicy, probe: U) -> Self {
        Self {
            home,
            policy,
            probe,
        }
    }

    /// Policy this engine applies
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Plan against the current listing without touching anything
    pub fn plan(&self, now: NaiveDateTime) -> Result<RetentionPlan> {
        Ok(self.policy.plan(&self.home.snapshots()?, now))
    }

    /// Mark, sweep, then prune for capacity
    pub fn run(&self, now: NaiveDateTime, sink: &dyn OutputSink) -> Result<RetentionReport> {
        let plan = self.plan(now)?;
        if !plan.is_empty() {
            info!(
                "Retention marked {} by reduction, {} by age, {} by count",
                plan.reduction.len(),
                plan.age.len(),
                plan.count.len()
            );
        }

        for snapshot in plan.all() {
            self.home.mark_for_deletion(&snapshot)?;
        }

        let names = |list: &[SnapshotName]| list.iter().map(|s| s.to_string()).collect();
        let mut report = RetentionReport {
            marked_by_reduction: names(&plan.reduction),
            marked_by_age: names(&plan.age),
            marked_by_count: names(&plan.count),
            ..Default::default()
        };

        report.sweep = self.home.sweep(sink)?;
        if !plan.is_empty() {
            // A marked snapshot may have been the Latest target
            self.home.update_latest_link()?;
        }

        report.pruned_for_capacity = self.prune_for_capacity(sink)?;
        Ok(report)
    }

    /// Remove oldest snapshots while the volume is over the threshold
    ///
    /// Stops with one snapshot left however full the volume still is.
    pub fn prune_for_capacity(&self, sink: &dyn OutputSink) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        let threshold = self.policy.drive_percentage;
        if threshold == 0 {
            return Ok(pruned);
        }

        loop {
            let usage = match self.probe.usage_percent(self.home.path()) {
                Ok(usage) => usage,
                Err(e) => {
                    warn!("Skipping capacity pruning: {}", e);
                    break;
                }
            };
            if usage <= threshold {
                debug!("Backup volume at {}%, threshold {}%", usage, threshold);
                break;
            }

            let snapshots = self.home.snapshots()?;
            if snapshots.len() <= 1 {
                warn!(
                    "Backup volume at {}% exceeds {}% with only one snapshot left",
                    usage, threshold
                );
                break;
            }

            let oldest = &snapshots[0];
            sink.line(&format!("Deleting: {}", oldest));
            self.home.delete_snapshot(oldest)?;
            info!("Removed {} for capacity ({}% used)", oldest, usage);
            pruned.push(oldest.to_string());
        }
        Ok(pruned)
    }
}
