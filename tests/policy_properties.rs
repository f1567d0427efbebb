//! Property tests: policy round-trip, keep memoization, eviction termination,
//! and preview/execute symmetry.

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use proptest::prelude::*;

use zfs_snapshot_cleaner::core::config::{DatasetConfig, PoolConfig};
use zfs_snapshot_cleaner::logger::ActivityLog;
use zfs_snapshot_cleaner::model::accounting::RunMode;
use zfs_snapshot_cleaner::model::discovery::discover;
use zfs_snapshot_cleaner::platform::files::MockFiles;
use zfs_snapshot_cleaner::platform::zfs::MockStorage;
use zfs_snapshot_cleaner::policy::keep::{KEEP_TAG, KeepEngine};
use zfs_snapshot_cleaner::policy::rules::{RetentionRule, RuleSet};
use zfs_snapshot_cleaner::reaper::eviction::TieBreak;
use zfs_snapshot_cleaner::reaper::executor::ActionExecutor;
use zfs_snapshot_cleaner::reaper::run::{RunReport, Runner};

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 17)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn arb_weekday() -> impl Strategy<Value = Weekday> {
    prop::sample::select(vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ])
}

fn arb_rule() -> impl Strategy<Value = RetentionRule> {
    prop_oneof![
        Just(RetentionRule::All),
        Just(RetentionRule::Nothing),
        (0u32..500).prop_map(RetentionRule::WithinHours),
        (0u32..500).prop_map(RetentionRule::WithinDays),
        (0u32..100).prop_map(RetentionRule::WithinWeeks),
        (0u32..60, arb_weekday()).prop_map(|(weeks, weekday)| RetentionRule::Weekday { weeks, weekday }),
        (0u32..36, 1u8..=5, arb_weekday()).prop_map(|(months, nth, weekday)| {
            RetentionRule::WeekdayOfMonth {
                months,
                nth,
                weekday,
            }
        }),
        (0u32..36, 1u32..=31).prop_map(|(months, day)| RetentionRule::DayOfMonth { months, day }),
        (0u32..12, 1u32..=31).prop_map(|(quarters, day)| RetentionRule::DayOfQuarter { quarters, day }),
        "[a-z0-9_.:-]{1,16}".prop_map(RetentionRule::SnapshotName),
    ]
}

/// Datasets `tank/d0..dn`, each with snapshots of the given sizes, one per day.
fn scenario(sizes: &[Vec<u64>], headroom: u64, available: u64) -> MockStorage {
    let total: u64 = sizes.iter().flatten().sum();
    let mut storage = MockStorage::new("tank", total + headroom, available);
    let mut day = 0u64;
    for (d, snaps) in sizes.iter().enumerate() {
        let dataset = format!("tank/d{d}");
        storage = storage.filesystem(&dataset, 10);
        for (s, size) in snaps.iter().enumerate() {
            day += 1;
            let created = now() - chrono::Duration::days(i64::try_from(day).unwrap());
            storage = storage.snapshot(&format!("{dataset}@s{s}"), created, *size);
        }
    }
    storage
}

fn clean(storage: &MockStorage, mode: RunMode, pool: &PoolConfig) -> RunReport {
    let files = MockFiles::new(now());
    let mut audit = ActivityLog::disabled();
    Runner::new(storage, &files, mode, now())
        .clean(pool, &mut audit)
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Rendering a rule set and parsing it back preserves clause order and count.
    #[test]
    fn rule_sets_round_trip(rules in prop::collection::vec(arb_rule(), 0..6)) {
        let set = RuleSet::from_rules(rules);
        let parsed: RuleSet = set.to_string().parse().unwrap();
        prop_assert_eq!(parsed.len(), set.len());
        prop_assert_eq!(parsed, set);
    }

    /// A verdict is computed once: asking again issues no storage call and
    /// returns the same value, and at most one hold or release is issued.
    #[test]
    fn keep_verdict_is_memoized(
        retention in prop::collection::vec(arb_rule(), 0..3),
        max_retention in prop::collection::vec(arb_rule(), 0..3),
        pre_held in any::<bool>(),
        days_old in 0i64..400,
    ) {
        let created = now() - chrono::Duration::days(days_old);
        let mut storage = MockStorage::new("tank", 100, 100)
            .filesystem("tank/a", 10)
            .snapshot("tank/a@snap", created, 5);
        if pre_held {
            storage = storage.with_hold("tank/a@snap", KEEP_TAG);
        }
        let mut pool = discover(&storage, "tank", RunMode::Execute).unwrap();
        let ds = pool.dataset_by_name("tank/a").unwrap();
        pool.dataset_mut(ds).policy.retention_policy = Some(RuleSet::from_rules(retention));
        pool.dataset_mut(ds).policy.max_retention = Some(RuleSet::from_rules(max_retention));
        let id = pool.dataset(ds).snapshots[0];

        let files = MockFiles::new(now());
        let mut audit = ActivityLog::disabled();
        let engine = KeepEngine::new(now());
        let mut exec = ActionExecutor::new(RunMode::Execute, "tank", &storage, &files, &mut audit);

        let first = engine.verdict(&mut pool, id, &mut exec).unwrap();
        let calls_after_first = storage.calls().len();
        let second = engine.verdict(&mut pool, id, &mut exec).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(storage.calls().len(), calls_after_first);
        prop_assert!(storage.mutations().len() <= 1);
        prop_assert_eq!(storage.holds_of("tank/a@snap").contains(KEEP_TAG), !first.is_destroyable());
    }

    /// Eviction always ends: either under threshold or with nothing left.
    #[test]
    fn eviction_terminates(
        sizes in prop::collection::vec(prop::collection::vec(1u64..200, 0..6), 1..4),
        headroom in 0u64..500,
        available in 0u64..500,
        tie_break in prop::sample::select(vec![
            TieBreak::Oldest,
            TieBreak::MoreRemovable,
            TieBreak::Biggest,
            TieBreak::More,
        ]),
    ) {
        let storage = scenario(&sizes, headroom, available);
        let mut pool = PoolConfig::new("tank");
        pool.best_effort_policy = tie_break.to_string();
        let report = clean(&storage, RunMode::Execute, &pool);

        let total: usize = sizes.iter().map(Vec::len).sum();
        prop_assert!(report.destroyed.len() <= total);
        prop_assert_eq!(report.snapshot_count, total - report.destroyed.len());
        if report.stopped_best_effort {
            prop_assert_eq!(report.snapshot_count, 0);
            prop_assert!(report.final_capacity > 0.8);
        } else {
            prop_assert!(report.final_capacity <= 0.8);
        }
    }

    /// A preview run predicts exactly what an execute run does.
    #[test]
    fn preview_matches_execute(
        sizes in prop::collection::vec(prop::collection::vec(1u64..200, 0..5), 1..4),
        headroom in 0u64..300,
        available in 0u64..300,
        protect in prop::collection::vec(arb_rule(), 0..2),
    ) {
        let mut pool = PoolConfig::new("tank");
        let mut first = DatasetConfig::new("tank/d0");
        first.retention_policy = Some(RuleSet::from_rules(protect).to_string());
        first.max_retention = Some("20 days".to_string());
        pool.datasets.push(first);

        let preview_storage = scenario(&sizes, headroom, available);
        let preview = clean(&preview_storage, RunMode::Preview, &pool);
        let exec_storage = scenario(&sizes, headroom, available);
        let executed = clean(&exec_storage, RunMode::Execute, &pool);

        prop_assert!(preview_storage.mutations().is_empty());
        prop_assert_eq!(&preview.destroyed, &executed.destroyed);
        prop_assert_eq!(&preview.holds_placed, &executed.holds_placed);
        prop_assert_eq!(preview.available, executed.available);
        prop_assert_eq!(preview.snapshot_count, executed.snapshot_count);
        prop_assert_eq!(preview.stopped_best_effort, executed.stopped_best_effort);
    }
}
