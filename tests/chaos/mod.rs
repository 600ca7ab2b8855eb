//! Chaos tests for Strata
//!
//! Runs against backup homes left in bad shape: interrupted snapshots,
//! garbage lock files, stray directories, dangling `Latest` links, and
//! source trees that change or become unreadable underneath the walk.

use ::strata::*;
use chrono::{NaiveDate, NaiveDateTime};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tempfile::TempDir;

/// A source tree, a registered backup volume and a Strata over both
pub struct ChaosSetup {
    pub source: TempDir,
    pub backup: TempDir,
    pub strata: Strata,
}

impl ChaosSetup {
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        fs::write(source.path().join("data.txt"), "current").unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("sub/nested.txt"), "nested").unwrap();

        let strata = StrataBuilder::new()
            .root(source.path())
            .backup_location(backup.path())
            .host_name("chaos")
            .hooks(Box::new(NoOpHook))
            .build();
        strata.register().unwrap();
        Self { source, backup, strata }
    }

    pub fn home(&self) -> BackupHome {
        self.strata.home().unwrap()
    }
}

impl Default for ChaosSetup {
    fn default() -> Self {
        Self::new()
    }
}

pub fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2012, 5, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn restore_mode(path: &Path, mode: u32) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_interrupted_snapshot_is_never_a_link_source() {
        let setup = ChaosSetup::new();
        let complete = setup.strata.run_at(at(25, 12)).unwrap().snapshot;

        // A crashed run newer than the complete snapshot, holding a file
        // with the source's name, size and mtime
        let home = setup.home();
        let partial = home.path().join("2012-05-26-120000.part");
        fs::create_dir(&partial).unwrap();
        fs::copy(setup.source.path().join("data.txt"), partial.join("data.txt")).unwrap();
        let source_meta = fs::metadata(setup.source.path().join("data.txt")).unwrap();
        filetime::set_file_mtime(
            partial.join("data.txt"),
            filetime::FileTime::from_last_modification_time(&source_meta),
        )
        .unwrap();
        let partial_ino = fs::metadata(partial.join("data.txt")).unwrap().ino();

        let report = setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(report.previous, Some(complete.clone()));
        assert_eq!(report.recovered, vec!["2012-05-26-120000"]);
        assert_eq!(report.retention.sweep.swept, vec!["2012-05-26-120000.delete"]);

        let linked = home.snapshot_path(&report.snapshot).join("data.txt");
        let original = home.snapshot_path(&complete).join("data.txt");
        assert_eq!(fs::metadata(&linked).unwrap().ino(), fs::metadata(&original).unwrap().ino());
        assert_ne!(fs::metadata(&linked).unwrap().ino(), partial_ino);
        assert!(!partial.exists());
        assert!(home.in_progress().unwrap().is_empty());
    }

    #[test]
    fn test_leftover_delete_directories_are_swept() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        fs::create_dir_all(home.path().join("2012-05-01-000000.delete/deep/tree")).unwrap();
        fs::write(home.path().join("2012-05-01-000000.delete/deep/tree/file"), "x").unwrap();

        let report = setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(report.retention.sweep.swept, vec!["2012-05-01-000000.delete"]);
        assert!(home.marked_for_deletion().unwrap().is_empty());
    }

    #[test]
    fn test_partial_and_delete_with_same_name() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        fs::create_dir(home.path().join("2012-05-26-120000.part")).unwrap();
        fs::create_dir(home.path().join("2012-05-26-120000.delete")).unwrap();

        setup.strata.run_at(at(27, 12)).unwrap();
        let names: Vec<String> = fs::read_dir(home.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("2012-05-26"))
            .collect();
        assert!(names.is_empty(), "leftovers: {:?}", names);
    }

    #[test]
    #[traced_test]
    fn test_garbage_lock_file_is_discarded() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        fs::write(home.lock_path(), "definitely not a pid\n").unwrap();

        setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(setup.strata.snapshots().unwrap().len(), 1);
        assert!(!home.lock_path().exists());
    }

    #[test]
    fn test_empty_lock_file_is_discarded() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        fs::write(home.lock_path(), "").unwrap();

        assert!(setup.strata.run_at(at(27, 12)).is_ok());
    }

    #[test]
    fn test_stray_entries_in_home_are_left_alone() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        fs::create_dir(home.path().join("lost+found")).unwrap();
        fs::create_dir(home.path().join("2012-13-45-999999")).unwrap();
        fs::write(home.path().join("notes.txt"), "keep me").unwrap();

        let strata = StrataBuilder::new()
            .root(setup.source.path())
            .backup_location(setup.backup.path())
            .host_name("chaos")
            .max_images(1)
            .hooks(Box::new(NoOpHook))
            .build();
        strata.run_at(at(26, 12)).unwrap();
        strata.run_at(at(27, 12)).unwrap();

        assert_eq!(strata.snapshots().unwrap().len(), 1);
        assert!(home.path().join("lost+found").is_dir());
        assert!(home.path().join("2012-13-45-999999").is_dir());
        assert_eq!(fs::read_to_string(home.path().join("notes.txt")).unwrap(), "keep me");
    }

    #[test]
    fn test_dangling_latest_is_repaired() {
        let setup = ChaosSetup::new();
        let home = setup.home();
        home.ensure_exists().unwrap();
        symlink("2011-01-01-000000", home.latest_link()).unwrap();

        let report = setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(home.latest().unwrap(), Some(report.snapshot));
    }

    #[test]
    fn test_tampered_previous_snapshot_is_copied_from_source() {
        let setup = ChaosSetup::new();
        let first = setup.strata.run_at(at(26, 12)).unwrap().snapshot;
        let home = setup.home();

        // Remove one copy and replace another with a directory
        fs::remove_file(home.snapshot_path(&first).join("sub/nested.txt")).unwrap();
        fs::remove_file(home.snapshot_path(&first).join("data.txt")).unwrap();
        fs::create_dir(home.snapshot_path(&first).join("data.txt")).unwrap();

        let report = setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(report.stats.files_copied, 2);
        assert_eq!(report.stats.files_linked, 0);
        let snapshot = home.snapshot_path(&report.snapshot);
        assert_eq!(fs::read_to_string(snapshot.join("data.txt")).unwrap(), "current");
        assert_eq!(fs::read_to_string(snapshot.join("sub/nested.txt")).unwrap(), "nested");
    }

    #[test]
    #[traced_test]
    fn test_unreadable_directory_is_counted_not_fatal() {
        if is_root() {
            // Permission bits don't stop root
            return;
        }
        let setup = ChaosSetup::new();
        let locked = setup.source.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let result = setup.strata.run_at(at(27, 12));
        restore_mode(&locked, 0o755);

        let report = result.unwrap();
        assert!(report.stats.has_failures());
        let snapshot = setup.home().snapshot_path(&report.snapshot);
        assert_eq!(fs::read_to_string(snapshot.join("data.txt")).unwrap(), "current");
        assert!(!snapshot.join("locked/secret.txt").exists());
        restore_mode(&snapshot.join("locked"), 0o755);
    }

    #[test]
    fn test_unreadable_file_is_counted_not_fatal() {
        if is_root() {
            return;
        }
        let setup = ChaosSetup::new();
        let private = setup.source.path().join("private.key");
        fs::write(&private, "key").unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o000)).unwrap();

        let result = setup.strata.run_at(at(27, 12));
        restore_mode(&private, 0o600);

        let report = result.unwrap();
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.files_copied, 2);
    }

    #[test]
    fn test_dangling_symlink_in_source_is_replicated() {
        let setup = ChaosSetup::new();
        symlink("/nonexistent/target", setup.source.path().join("broken")).unwrap();

        let report = setup.strata.run_at(at(27, 12)).unwrap();
        assert_eq!(report.stats.symlinks, 1);
        let link = setup.home().snapshot_path(&report.snapshot).join("broken");
        assert_eq!(fs::read_link(link).unwrap(), Path::new("/nonexistent/target"));
    }

    #[test]
    fn test_many_runs_leave_one_lock_free_home() {
        let setup = ChaosSetup::new();
        for hour in 0..12 {
            if hour % 3 == 0 {
                fs::write(setup.source.path().join(format!("file-{}.txt", hour)), "x").unwrap();
            }
            setup.strata.run_at(at(27, hour)).unwrap();
        }
        let home = setup.home();
        assert_eq!(home.snapshots().unwrap().len(), 12);
        assert!(!home.lock_path().exists());
        assert!(home.in_progress().unwrap().is_empty());
        assert_eq!(home.latest().unwrap(), home.most_recent().unwrap());
    }
}
