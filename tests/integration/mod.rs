//! Integration tests for Strata
//!
//! Complete runs through [`StrataBuilder`] against temporary source trees
//! and backup volumes: linking across many snapshots, the single-instance
//! lock, retention and hook scripts.

use ::strata::*;
use chrono::{NaiveDate, NaiveDateTime};
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

/// Source tree and registered backup volume for one test
pub struct StrataTestHarness {
    pub source: TempDir,
    pub backup: TempDir,
}

impl StrataTestHarness {
    /// Fresh source tree with a few files and a registered backup volume
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("docs/drafts")).unwrap();
        fs::write(source.path().join("readme.md"), "# readme").unwrap();
        fs::write(source.path().join("docs/guide.md"), "guide").unwrap();
        fs::write(source.path().join("docs/drafts/idea.md"), "idea").unwrap();
        snapshot::register_backup_location(backup.path(), None).unwrap();
        Self { source, backup }
    }

    /// Builder pointed at the harness, with no hooks
    pub fn builder(&self) -> StrataBuilder {
        StrataBuilder::new()
            .root(self.source.path())
            .backup_location(self.backup.path())
            .host_name("integration")
            .hooks(Box::new(NoOpHook))
    }

    pub fn home(&self) -> BackupHome {
        BackupHome::for_host(self.backup.path(), "integration")
    }

    /// Path of `relative` inside snapshot `name`
    pub fn in_snapshot(&self, name: &SnapshotName, relative: &str) -> PathBuf {
        self.home().snapshot_path(name).join(relative)
    }

    /// Rewrite a source file and push its mtime forward so the change is seen
    pub fn modify(&self, relative: &str, content: &str) {
        let path = self.source.path().join(relative);
        let old = fs::metadata(&path).map(|m| m.mtime()).unwrap_or(0);
        fs::write(&path, content).unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(old + 60, 0)).unwrap();
    }
}

impl Default for StrataTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage probe reporting a fixed percentage
pub struct FixedUsage(pub u8);

impl UsageProbe for FixedUsage {
    fn usage_percent(&self, _path: &Path) -> Result<u8> {
        Ok(self.0)
    }
}

/// Process probe with a fixed answer
pub struct AssumeAlive(pub bool);

impl ProcessProbe for AssumeAlive {
    fn is_alive(&self, _pid: i32) -> bool {
        self.0
    }
}

pub fn at(month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2012, month, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_week_of_snapshots_shares_unchanged_files() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().build();

        let mut reports = Vec::new();
        for day in 20..27 {
            if day == 23 {
                harness.modify("docs/guide.md", "guide, second edition");
            }
            reports.push(strata.run_at(at(5, day, 12)).unwrap());
        }

        assert_eq!(reports[0].stats.files_copied, 3);
        assert_eq!(reports[1].stats.files_linked, 3);
        assert_eq!(reports[3].stats.files_copied, 1);
        assert_eq!(reports[3].stats.files_linked, 2);

        let first = &reports[0].snapshot;
        let last = &reports[6].snapshot;
        let ino = |name: &SnapshotName, rel: &str| fs::metadata(harness.in_snapshot(name, rel)).unwrap().ino();

        assert_eq!(ino(first, "readme.md"), ino(last, "readme.md"));
        assert_eq!(fs::metadata(harness.in_snapshot(last, "readme.md")).unwrap().nlink(), 7);
        assert_ne!(ino(first, "docs/guide.md"), ino(last, "docs/guide.md"));
        assert_eq!(
            fs::read_to_string(harness.in_snapshot(last, "docs/guide.md")).unwrap(),
            "guide, second edition"
        );
        assert_eq!(fs::read_to_string(harness.in_snapshot(first, "docs/guide.md")).unwrap(), "guide");

        assert_eq!(harness.home().latest().unwrap(), Some(last.clone()));
        assert_eq!(strata.snapshots().unwrap().len(), 7);
    }

    #[test]
    fn test_deleted_source_file_survives_in_older_snapshot() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().build();

        let first = strata.run_at(at(5, 26, 12)).unwrap();
        fs::remove_file(harness.source.path().join("docs/drafts/idea.md")).unwrap();
        let second = strata.run_at(at(5, 27, 12)).unwrap();

        assert!(harness.in_snapshot(&first.snapshot, "docs/drafts/idea.md").exists());
        assert!(!harness.in_snapshot(&second.snapshot, "docs/drafts/idea.md").exists());
        assert!(harness.in_snapshot(&second.snapshot, "docs/drafts").is_dir());
    }

    #[test]
    fn test_live_lock_refuses_without_touching_anything() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().build();
        strata.run_at(at(5, 26, 12)).unwrap();

        let lock = harness.home().lock_path();
        fs::write(&lock, format!("{}\n", std::process::id())).unwrap();

        let calls = Rc::new(RefCell::new(0));
        struct Count(Rc<RefCell<u32>>);
        impl BackupHook for Count {
            fn pre_backup(&self) {
                *self.0.borrow_mut() += 1;
            }
            fn post_backup(&self) {
                *self.0.borrow_mut() += 1;
            }
            fn pre_retention(&self) {}
            fn post_retention(&self) {}
        }
        let locked_out = harness
            .builder()
            .hooks(Box::new(Count(Rc::clone(&calls))))
            .build();

        let err = locked_out.run_at(at(5, 27, 12)).unwrap_err();
        assert!(matches!(err, StrataError::AlreadyRunning { .. }));
        assert_eq!(*calls.borrow(), 0);
        assert_eq!(strata.snapshots().unwrap().len(), 1);
        assert!(harness.home().in_progress().unwrap().is_empty());
        // The holder's lock stays in place
        assert_eq!(
            fs::read_to_string(&lock).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    #[traced_test]
    fn test_stale_lock_is_replaced() {
        let harness = StrataTestHarness::new();
        harness.home().ensure_exists().unwrap();
        fs::write(harness.home().lock_path(), "4194303\n").unwrap();

        let strata = harness
            .builder()
            .process_probe(Box::new(AssumeAlive(false)))
            .build();
        let report = strata.run_at(at(5, 27, 12)).unwrap();

        assert_eq!(report.stats.files_copied, 3);
        assert!(!harness.home().lock_path().exists());
    }

    #[test]
    fn test_daily_reduction_across_runs() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().reduce_backups(true).build();

        strata.run_at(at(5, 20, 9)).unwrap();
        strata.run_at(at(5, 20, 18)).unwrap();
        strata.run_at(at(5, 21, 9)).unwrap();
        // Nothing is old enough to reduce yet
        assert_eq!(strata.snapshots().unwrap().len(), 3);

        let report = strata.run_at(at(5, 27, 12)).unwrap();
        assert_eq!(report.retention.marked_by_reduction, vec!["2012-05-20-090000"]);
        assert_eq!(report.retention.sweep.swept, vec!["2012-05-20-090000.delete"]);

        let remaining: Vec<String> = strata.snapshots().unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            remaining,
            vec!["2012-05-20-180000", "2012-05-21-090000", "2012-05-27-120000"]
        );
        // Data of the swept snapshot is still reachable through the survivors
        let survivor = SnapshotName::parse("2012-05-20-180000").unwrap();
        assert_eq!(fs::read_to_string(harness.in_snapshot(&survivor, "readme.md")).unwrap(), "# readme");
    }

    #[test]
    fn test_keep_days_and_max_images_together() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().build();
        for day in [1, 5, 10, 15, 20, 25] {
            strata.run_at(at(5, day, 12)).unwrap();
        }

        let pruning = harness.builder().keep_days(20).max_images(2).build();
        let report = pruning.run_at(at(5, 27, 12)).unwrap();

        // 05-01 and 05-05 are past 20 days; of the rest only the newest two stay
        let by_age: Vec<&str> = report.retention.marked_by_age.iter().map(String::as_str).collect();
        assert_eq!(by_age, vec!["2012-05-01-120000", "2012-05-05-120000"]);
        assert_eq!(report.retention.marked_by_count.len(), 3);

        let remaining: Vec<String> = pruning.snapshots().unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(remaining, vec!["2012-05-25-120000", "2012-05-27-120000"]);
        assert_eq!(harness.home().latest().unwrap().unwrap().as_str(), "2012-05-27-120000");
    }

    #[test]
    fn test_capacity_pruning_keeps_the_new_snapshot() {
        let harness = StrataTestHarness::new();
        let strata = harness.builder().build();
        for day in 24..27 {
            strata.run_at(at(5, day, 12)).unwrap();
        }

        let full = harness
            .builder()
            .drive_percentage(90)
            .usage_probe(Box::new(FixedUsage(97)))
            .build();
        let report = full.run_at(at(5, 27, 12)).unwrap();

        assert_eq!(report.retention.pruned_for_capacity.len(), 3);
        assert_eq!(full.snapshots().unwrap(), vec![report.snapshot.clone()]);
        assert_eq!(fs::read_to_string(harness.in_snapshot(&report.snapshot, "readme.md")).unwrap(), "# readme");
    }

    #[test]
    fn test_progress_lines_reach_the_sink() {
        let harness = StrataTestHarness::new();
        fs::write(harness.source.path().join("scratch.tmp"), "tmp").unwrap();
        let lines = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink_lines = Rc::clone(&lines);

        let strata = harness
            .builder()
            .ignore_patterns(vec!["*.tmp".to_string()])
            .output_sink(Box::new(move |line: &str| sink_lines.borrow_mut().push(line.to_string())))
            .build();
        strata.run_at(at(5, 26, 12)).unwrap();
        strata.run_at(at(5, 27, 12)).unwrap();

        let root = fs::canonicalize(harness.source.path()).unwrap();
        let lines = lines.borrow();
        assert!(lines.contains(&format!("Copying: {}", root.join("readme.md").display())));
        assert!(lines.contains(&format!("Linking: {}", root.join("readme.md").display())));
        assert!(lines.contains(&format!("Ignore: {}", root.join("scratch.tmp").display())));
    }

    #[test]
    fn test_hook_scripts_run_around_backup() {
        use std::os::unix::fs::PermissionsExt;

        let harness = StrataTestHarness::new();
        let hooks = TempDir::new().unwrap();
        let marker = hooks.path().join("ran");
        let script = hooks.path().join("pre").join("10-mark");
        fs::create_dir(hooks.path().join("pre")).unwrap();
        fs::write(&script, format!("#!/bin/sh\necho pre >> '{}'\n", marker.display())).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config = StrataConfig {
            root: harness.source.path().to_path_buf(),
            backup_location: Some(harness.backup.path().to_path_buf()),
            host_name: "integration".to_string(),
            pre_backup_hooks: Some(hooks.path().join("pre")),
            ..Default::default()
        };
        Strata::new(config).run_at(at(5, 27, 12)).unwrap();

        assert_eq!(fs::read_to_string(&marker).unwrap(), "pre\n");
    }

    #[test]
    fn test_config_file_drives_a_run() {
        let harness = StrataTestHarness::new();
        let config_dir = TempDir::new().unwrap();
        let config_path = config_dir.path().join("strata.toml");
        fs::write(
            &config_path,
            format!(
                "root = {:?}\nbackup_location = {:?}\nhost_name = \"integration\"\nignore = [\"drafts/\"]\nmax_images = 1\n",
                harness.source.path().display().to_string(),
                harness.backup.path().display().to_string(),
            ),
        )
        .unwrap();

        let strata = Strata::new(StrataConfig::discover(Some(&config_path)).unwrap());
        strata.run_at(at(5, 26, 12)).unwrap();
        let report = strata.run_at(at(5, 27, 12)).unwrap();

        assert_eq!(strata.snapshots().unwrap(), vec![report.snapshot.clone()]);
        assert!(!harness.in_snapshot(&report.snapshot, "docs/drafts").exists());
        assert!(harness.in_snapshot(&report.snapshot, "docs/guide.md").exists());
    }
}
