//! Property-based testing for Strata
//!
//! Uses proptest to check the retention invariants against randomly
//! generated snapshot collections, both as pure plans and against real
//! backup homes on disk.

use ::strata::retention::{self, RetentionBucket};
use ::strata::*;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2012, 5, 27)
        .unwrap()
        .and_hms_opt(12, 7, 28)
        .unwrap()
}

/// Snapshot names up to a year before `now`, deduplicated and sorted
fn snapshots_strategy(max: usize) -> impl Strategy<Value = Vec<SnapshotName>> {
    prop::collection::btree_set(0i64..365 * 24 * 60, 0..max).prop_map(|minutes| {
        minutes
            .into_iter()
            .map(|m| SnapshotName::from_datetime(now() - TimeDelta::minutes(m)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    })
}

fn without(all: &[SnapshotName], removed: &[SnapshotName]) -> Vec<SnapshotName> {
    all.iter().filter(|s| !removed.contains(s)).cloned().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Max count keeps exactly the newest N
    #[test]
    fn max_count_keeps_newest(
        snapshots in snapshots_strategy(60),
        max in 1usize..40,
    ) {
        let marked = retention::over_max_count(&snapshots, max);
        let kept = without(&snapshots, &marked);

        prop_assert_eq!(kept.len(), snapshots.len().min(max));
        if let (Some(newest_marked), Some(oldest_kept)) = (marked.last(), kept.first()) {
            prop_assert!(newest_marked < oldest_kept);
        }
    }

    /// Daily reduction keeps the newest snapshot of every day
    #[test]
    fn daily_keeps_one_per_day(snapshots in snapshots_strategy(80)) {
        let buckets = retention::categorize(&snapshots, now());
        let marked = retention::extra_daily(&buckets.daily);
        let kept = without(&buckets.daily, &marked);

        let days: BTreeSet<_> = buckets.daily.iter().map(|s| s.timestamp().date()).collect();
        let kept_days: Vec<_> = kept.iter().map(|s| s.timestamp().date()).collect();
        prop_assert_eq!(kept_days.len(), days.len());
        prop_assert_eq!(kept_days.into_iter().collect::<BTreeSet<_>>(), days);

        for snapshot in &marked {
            let day = snapshot.timestamp().date();
            prop_assert!(kept.iter().any(|k| k.timestamp().date() == day && k > snapshot));
        }
    }

    /// Weekly survivors are at least a week apart and every removed
    /// snapshot falls within a week after a survivor
    #[test]
    fn weekly_survivors_are_spaced(snapshots in snapshots_strategy(80)) {
        let buckets = retention::categorize(&snapshots, now());
        let marked = retention::extra_weekly(&buckets.weekly);
        let kept = without(&buckets.weekly, &marked);

        for pair in kept.windows(2) {
            let gap = pair[1].timestamp().date() - pair[0].timestamp().date();
            prop_assert!(gap >= TimeDelta::days(7));
        }
        for snapshot in &marked {
            let day = snapshot.timestamp().date();
            let covered = kept.iter().any(|k| {
                let anchor = k.timestamp().date();
                anchor <= day && day - anchor < TimeDelta::days(7)
            });
            prop_assert!(covered);
        }
    }

    /// Buckets partition the input by age
    #[test]
    fn buckets_partition(snapshots in snapshots_strategy(80)) {
        let buckets = retention::categorize(&snapshots, now());
        prop_assert_eq!(
            buckets.today.len() + buckets.daily.len() + buckets.weekly.len(),
            snapshots.len()
        );
        for s in &buckets.today {
            prop_assert_eq!(RetentionBucket::of(s, now()), RetentionBucket::Today);
        }
        for s in &buckets.weekly {
            prop_assert!(now() - s.timestamp() >= TimeDelta::days(31));
        }
    }

    /// The composed plan never chooses a snapshot twice and honors every bound
    #[test]
    fn composed_plan_is_consistent(
        snapshots in snapshots_strategy(80),
        reduce in any::<bool>(),
        keep_days in 0u32..200,
        max_images in 0usize..30,
    ) {
        let policy = RetentionPolicy {
            reduce_backups: reduce,
            keep_days,
            max_images,
            drive_percentage: 0,
        };
        let plan = policy.plan(&snapshots, now());
        let all = plan.all();

        let unique: BTreeSet<_> = all.iter().collect();
        prop_assert_eq!(unique.len(), all.len());
        prop_assert!(all.iter().all(|s| snapshots.contains(s)));

        let kept = without(&snapshots, &all);
        if max_images > 0 {
            prop_assert!(kept.len() <= max_images);
        }
        if keep_days > 0 {
            let limit = TimeDelta::days(i64::from(keep_days));
            prop_assert!(kept.iter().all(|s| now() - s.timestamp() <= limit));
        }
        // Today's snapshots are only ever removed by age or count
        for s in &plan.reduction {
            prop_assert_ne!(RetentionBucket::of(s, now()), RetentionBucket::Today);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Retention against a real backup home leaves the planned survivors
    /// and points Latest at the newest one
    #[test]
    fn retention_on_disk_matches_plan(
        snapshots in snapshots_strategy(25),
        max_images in 1usize..10,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let home = BackupHome::new(temp_dir.path());
        for name in &snapshots {
            fs::create_dir(home.snapshot_path(name)).unwrap();
        }

        let policy = RetentionPolicy {
            max_images,
            ..Default::default()
        };
        let expected = without(&snapshots, &policy.plan(&snapshots, now()).all());
        RetentionEngine::new(home.clone(), policy).run(now(), &SilentSink).unwrap();

        prop_assert_eq!(home.snapshots().unwrap(), expected.clone());
        prop_assert!(home.marked_for_deletion().unwrap().is_empty());
        if snapshots.len() > max_images {
            prop_assert_eq!(home.latest().unwrap(), expected.last().cloned());
        }
    }
}
