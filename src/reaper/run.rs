//! One batch pass over a pool: discover, attach configuration, destroy what
//! max-retention rejects, prune files, evict under capacity pressure, report.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::config::PoolConfig;
use crate::core::errors::{Result, ZscError};
use crate::logger::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::model::accounting::RunMode;
use crate::model::discovery::discover;
use crate::model::hierarchy::Pool;
use crate::platform::files::FileOps;
use crate::platform::zfs::StorageBackend;
use crate::policy::keep::{KeepEngine, KeepVerdict, tags};
use crate::reaper::eviction::run_eviction;
use crate::reaper::executor::ActionExecutor;
use crate::reaper::pruner::{prune_by_age, prune_by_capacity};

/// End-of-run accounting for one pool.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub pool: String,
    pub dry_run: bool,
    /// Used by data.
    pub referenced: u64,
    /// Used by snapshots.
    pub snapshot_space: u64,
    pub available: u64,
    pub total: u64,
    pub snapshot_count: usize,
    /// Live snapshots per hold tag.
    pub tag_counts: BTreeMap<String, usize>,
    pub destroyed: Vec<String>,
    pub holds_placed: Vec<String>,
    pub holds_released: Vec<String>,
    pub files_deleted: usize,
    pub file_bytes_deleted: u64,
    pub dirs_deleted: usize,
    pub final_capacity: f64,
    pub stopped_best_effort: bool,
}

/// Keep status of one snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotStatus {
    pub snapshot: String,
    pub verdict: KeepVerdict,
    pub status: &'static str,
}

/// Attach configured policies to discovered datasets.
///
/// A configured dataset missing from the pool is reported and skipped.
pub fn apply_config(pool: &mut Pool, cfg: &PoolConfig) -> Result<()> {
    pool.settings = cfg.settings()?;
    for dataset in &cfg.datasets {
        match pool.dataset_by_name(&dataset.name) {
            Some(id) => pool.dataset_mut(id).policy = dataset.to_policy()?,
            None => {
                tracing::error!(
                    "dataset '{}' does NOT exist on pool '{}'",
                    dataset.name,
                    pool.name
                );
            }
        }
    }
    Ok(())
}

/// Drives runs against a storage backend and a filesystem.
pub struct Runner<'a> {
    storage: &'a dyn StorageBackend,
    files: &'a dyn FileOps,
    mode: RunMode,
    now: NaiveDateTime,
    config_hash: Option<String>,
}

impl<'a> Runner<'a> {
    pub fn new(
        storage: &'a dyn StorageBackend,
        files: &'a dyn FileOps,
        mode: RunMode,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            storage,
            files,
            mode,
            now,
            config_hash: None,
        }
    }

    /// Recorded in the run-start audit event.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    fn prepare(&self, cfg: &PoolConfig) -> Result<Pool> {
        let mut pool = discover(self.storage, &cfg.name, self.mode)?;
        apply_config(&mut pool, cfg)?;
        tracing::debug!(
            pool = %pool.name,
            datasets = pool.datasets().count(),
            snapshots = pool.snapshot_count(),
            "hierarchy discovered"
        );
        Ok(pool)
    }

    /// Full clean pass over one pool.
    pub fn clean(&self, cfg: &PoolConfig, audit: &mut ActivityLog) -> Result<RunReport> {
        let mut start = LogEntry::new(EventType::RunStart, Severity::Info, self.mode.is_dry_run())
            .pool(&cfg.name);
        if let Some(hash) = &self.config_hash {
            start = start.details(format!("config_hash={hash}"));
        }
        audit.record(&start);

        let result = self.clean_inner(cfg, audit);

        let complete = match &result {
            Ok(report) => LogEntry::new(EventType::RunComplete, Severity::Info, report.dry_run)
                .pool(&cfg.name)
                .details(format!(
                    "destroyed={} files_deleted={} dirs_deleted={} capacity={:.4}",
                    report.destroyed.len(),
                    report.files_deleted,
                    report.dirs_deleted,
                    report.final_capacity
                )),
            Err(err) => LogEntry::new(EventType::RunComplete, Severity::Critical, self.mode.is_dry_run())
                .pool(&cfg.name)
                .error(err)
                .details("aborted"),
        };
        audit.record(&complete);
        audit.flush();
        result
    }

    fn clean_inner(&self, cfg: &PoolConfig, audit: &mut ActivityLog) -> Result<RunReport> {
        let mut pool = self.prepare(cfg)?;
        let engine = KeepEngine::new(self.now);
        let mut exec = ActionExecutor::new(self.mode, &pool.name, self.storage, self.files, audit);

        // Snapshots no max-retention clause admits.
        for dataset in pool.dataset_ids() {
            for id in pool.dataset(dataset).snapshots.clone() {
                if engine.verdict(&mut pool, id, &mut exec)? == KeepVerdict::Destroy {
                    exec.destroy_snapshot(&mut pool, id)?;
                }
            }
        }

        for dataset in pool.dataset_ids() {
            prune_by_age(&pool, dataset, &mut exec)?;
        }
        for dataset in pool.dataset_ids() {
            prune_by_capacity(&pool, dataset, &mut exec)?;
        }

        let eviction = run_eviction(&mut pool, &engine, &mut exec)?;

        let mut tag_counts = BTreeMap::new();
        for id in pool.live_snapshots() {
            for tag in tags(&mut pool, id, &exec)? {
                *tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let used = pool.used(self.storage)?;
        let available = pool.available(self.storage)?;
        let referenced = pool.referenced(self.storage)?;
        let final_capacity = pool.capacity(self.storage)?;
        let tally = exec.into_tally();

        let report = RunReport {
            pool: pool.name.clone(),
            dry_run: self.mode.is_dry_run(),
            referenced,
            snapshot_space: used.saturating_sub(referenced),
            available,
            total: used.saturating_add(available),
            snapshot_count: pool.snapshot_count(),
            tag_counts,
            destroyed: tally.destroyed,
            holds_placed: tally.holds_placed,
            holds_released: tally.holds_released,
            files_deleted: tally.files_deleted,
            file_bytes_deleted: tally.file_bytes_deleted,
            dirs_deleted: tally.dirs_deleted,
            final_capacity,
            stopped_best_effort: eviction.stopped_best_effort,
        };
        log_report(&report);
        Ok(report)
    }

    /// Keep status of every live snapshot, dataset by dataset.
    ///
    /// Reconciles holds exactly as [`Runner::clean`] does.
    pub fn list(&self, cfg: &PoolConfig, audit: &mut ActivityLog) -> Result<Vec<SnapshotStatus>> {
        let mut pool = self.prepare(cfg)?;
        let engine = KeepEngine::new(self.now);
        let mut exec = ActionExecutor::new(self.mode, &pool.name, self.storage, self.files, audit);

        let mut out = Vec::with_capacity(pool.snapshot_count());
        for dataset in pool.dataset_ids() {
            for id in pool.dataset(dataset).snapshots.clone() {
                let verdict = engine.verdict(&mut pool, id, &mut exec)?;
                out.push(SnapshotStatus {
                    snapshot: pool.snapshot(id).name.clone(),
                    verdict,
                    status: verdict.status_label(),
                });
            }
        }
        Ok(out)
    }
}

fn log_report(report: &RunReport) {
    tracing::info!("Used by data\t\t{}", report.referenced);
    tracing::info!("Used by snapshots\t{}", report.snapshot_space);
    tracing::info!("Available\t\t{}", report.available);
    tracing::info!("Total size\t\t{}", report.total);
    tracing::info!("{} snapshots", report.snapshot_count);
    for (tag, count) in &report.tag_counts {
        tracing::info!("{count} snapshots held as '{tag}'");
    }
}

/// Error for a pool name not present in configuration.
#[must_use]
pub fn unknown_pool(name: &str) -> ZscError {
    ZscError::UnknownEntity {
        name: name.to_string(),
    }
}
