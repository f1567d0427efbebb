//! File pruning over real temporary directories.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Local;
use filetime::{FileTime, set_file_mtime};

use zfs_snapshot_cleaner::logger::ActivityLog;
use zfs_snapshot_cleaner::model::accounting::RunMode;
use zfs_snapshot_cleaner::model::discovery::discover;
use zfs_snapshot_cleaner::model::hierarchy::Pool;
use zfs_snapshot_cleaner::platform::files::{AgeFilter, FileOps, LocalFiles};
use zfs_snapshot_cleaner::platform::zfs::MockStorage;
use zfs_snapshot_cleaner::policy::rules::MaxFileAge;
use zfs_snapshot_cleaner::reaper::executor::ActionExecutor;
use zfs_snapshot_cleaner::reaper::pruner::{prune_by_age, prune_by_capacity};

const DAY: u64 = 24 * 60 * 60;

fn write_aged(path: &Path, size: usize, days_old: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, vec![b'x'; size]).unwrap();
    age(path, days_old);
}

fn age(path: &Path, days_old: u64) {
    let when = SystemTime::now() - Duration::from_secs(days_old * DAY);
    set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
}

/// `tank/data` at 100 of a 100-byte refquota, mounted at `mount`.
fn pool_with_quota(storage: &MockStorage, mount: &Path, mode: RunMode) -> Pool {
    let mut pool = discover(storage, "tank", mode).unwrap();
    let id = pool.dataset_by_name("tank/data").unwrap();
    let policy = &mut pool.dataset_mut(id).policy;
    policy.max_capacity = Some(0.8);
    policy.mount_point = Some(mount.to_path_buf());
    pool
}

fn quota_storage() -> MockStorage {
    MockStorage::new("tank", 500, 500)
        .filesystem("tank/data", 100)
        .with_property("tank/data", "refquota", "100")
}

#[test]
fn capacity_pass_deletes_up_to_cutoff_date() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_aged(&root.join("a.bin"), 10, 10);
    write_aged(&root.join("nested/b.bin"), 20, 5);
    write_aged(&root.join("c.bin"), 30, 1);
    age(&root.join("nested"), 5);

    let storage = quota_storage();
    let pool = pool_with_quota(&storage, root, RunMode::Execute);
    let id = pool.dataset_by_name("tank/data").unwrap();
    let files = LocalFiles::new(Local::now().naive_local());
    let mut audit = ActivityLog::disabled();
    let mut exec = ActionExecutor::new(RunMode::Execute, "tank", &storage, &files, &mut audit);

    // needed = 100 - 80 + 1 = 21; a (10) + b (20) reaches it at b.
    prune_by_capacity(&pool, id, &mut exec).unwrap();
    assert_eq!(exec.tally().files_deleted, 2);
    assert_eq!(exec.tally().file_bytes_deleted, 30);
    assert!(!root.join("a.bin").exists());
    assert!(!root.join("nested/b.bin").exists());
    assert!(root.join("c.bin").exists());
    assert!(root.exists());
}

#[test]
fn capacity_pass_preview_deletes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_aged(&root.join("a.bin"), 10, 10);
    write_aged(&root.join("b.bin"), 20, 5);

    let storage = quota_storage();
    let pool = pool_with_quota(&storage, root, RunMode::Preview);
    let id = pool.dataset_by_name("tank/data").unwrap();
    let files = LocalFiles::new(Local::now().naive_local());
    let mut audit = ActivityLog::disabled();
    let mut exec = ActionExecutor::new(RunMode::Preview, "tank", &storage, &files, &mut audit);

    prune_by_capacity(&pool, id, &mut exec).unwrap();
    assert_eq!(exec.tally().files_deleted, 2);
    assert!(root.join("a.bin").exists());
    assert!(root.join("b.bin").exists());
}

#[test]
fn capacity_pass_skips_without_quota() {
    let dir = tempfile::tempdir().unwrap();
    write_aged(&dir.path().join("a.bin"), 10, 10);

    let storage = MockStorage::new("tank", 500, 500).filesystem("tank/data", 100);
    let pool = pool_with_quota(&storage, dir.path(), RunMode::Execute);
    let id = pool.dataset_by_name("tank/data").unwrap();
    let files = LocalFiles::new(Local::now().naive_local());
    let mut audit = ActivityLog::disabled();
    let mut exec = ActionExecutor::new(RunMode::Execute, "tank", &storage, &files, &mut audit);

    prune_by_capacity(&pool, id, &mut exec).unwrap();
    assert_eq!(exec.tally().files_deleted, 0);
    assert!(dir.path().join("a.bin").exists());
}

#[test]
fn age_pass_uses_change_time_not_modification_time() {
    let dir = tempfile::tempdir().unwrap();
    // Old mtime, but the inode changed just now.
    write_aged(&dir.path().join("restored.tar"), 64, 90);

    let storage = quota_storage();
    let mut pool = pool_with_quota(&storage, dir.path(), RunMode::Execute);
    let id = pool.dataset_by_name("tank/data").unwrap();
    pool.dataset_mut(id).policy.max_file_age = Some(MaxFileAge::from_days(30));
    let files = LocalFiles::new(Local::now().naive_local());
    let mut audit = ActivityLog::disabled();
    let mut exec = ActionExecutor::new(RunMode::Execute, "tank", &storage, &files, &mut audit);

    prune_by_age(&pool, id, &mut exec).unwrap();
    assert_eq!(exec.tally().files_deleted, 0);
    assert!(dir.path().join("restored.tar").exists());
}

#[test]
fn missing_mount_point_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let storage = quota_storage();
    let mut pool = pool_with_quota(&storage, &dir.path().join("absent"), RunMode::Execute);
    let id = pool.dataset_by_name("tank/data").unwrap();
    pool.dataset_mut(id).policy.max_file_age = Some(MaxFileAge::from_days(1));
    let files = LocalFiles::new(Local::now().naive_local());
    let mut audit = ActivityLog::disabled();
    let mut exec = ActionExecutor::new(RunMode::Execute, "tank", &storage, &files, &mut audit);

    prune_by_age(&pool, id, &mut exec).unwrap();
    prune_by_capacity(&pool, id, &mut exec).unwrap();
    assert_eq!(exec.tally().files_deleted, 0);
}

#[test]
fn local_listing_filters_by_modification_age() {
    let dir = tempfile::tempdir().unwrap();
    write_aged(&dir.path().join("old"), 1, 40);
    write_aged(&dir.path().join("deep/er/older"), 1, 50);
    write_aged(&dir.path().join("fresh"), 1, 0);

    let files = LocalFiles::new(Local::now().naive_local());
    let mut listed: Vec<_> = files
        .list_files(dir.path(), AgeFilter::ModifiedOlderThanDays(30))
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect();
    listed.sort();
    assert_eq!(listed, [dir.path().join("deep/er/older"), dir.path().join("old")]);
}

#[cfg(unix)]
#[test]
fn local_listing_ignores_symlinks() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    write_aged(&outside.path().join("victim"), 1, 100);
    std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
    std::os::unix::fs::symlink(outside.path().join("victim"), dir.path().join("file-link")).unwrap();

    let files = LocalFiles::new(Local::now().naive_local());
    assert!(files.list_files(dir.path(), AgeFilter::Any).unwrap().is_empty());
}

#[test]
fn empty_directory_sweep_keeps_root_and_fresh_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("stale/inner")).unwrap();
    fs::create_dir_all(root.join("fresh")).unwrap();
    age(&root.join("stale/inner"), 20);
    age(&root.join("stale"), 20);
    age(root, 20);

    let files = LocalFiles::new(Local::now().naive_local());
    let removed = files
        .delete_empty_dirs(root, AgeFilter::ModifiedOlderThanDays(10))
        .unwrap();
    assert_eq!(removed, [root.join("stale/inner")]);
    assert!(root.exists());
    assert!(root.join("fresh").exists());
    // Removing `inner` touched `stale`, so it is no longer old enough.
    assert!(root.join("stale").exists());
}
