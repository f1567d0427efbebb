//! Action executor: the single place where hold, release, destroy and file
//! deletion are issued, or only logged when previewing.
//!
//! Every mutating call is logged at info with its command line before it
//! runs. In preview the same line is logged and nothing is called. Queries
//! (tag listing, file listing) run in both modes. Failures are recorded in
//! the activity log and returned; nothing is retried.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{Result, ZscError};
use crate::logger::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::model::accounting::RunMode;
use crate::model::hierarchy::{Pool, SnapshotId};
use crate::platform::files::{AgeFilter, FileOps};
use crate::platform::zfs::{
    StorageBackend, destroy_args, hold_args, release_args, render_command,
};
use crate::policy::keep::KEEP_TAG;

/// What the executor issued (or previewed) during one pool run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ActionTally {
    pub destroyed: Vec<String>,
    pub holds_placed: Vec<String>,
    pub holds_released: Vec<String>,
    pub files_deleted: usize,
    pub file_bytes_deleted: u64,
    pub dirs_deleted: usize,
}

pub struct ActionExecutor<'a> {
    mode: RunMode,
    pool: String,
    storage: &'a dyn StorageBackend,
    files: &'a dyn FileOps,
    audit: &'a mut ActivityLog,
    tally: ActionTally,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        mode: RunMode,
        pool: impl Into<String>,
        storage: &'a dyn StorageBackend,
        files: &'a dyn FileOps,
        audit: &'a mut ActivityLog,
    ) -> Self {
        Self {
            mode,
            pool: pool.into(),
            storage,
            files,
            audit,
            tally: ActionTally::default(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    #[must_use]
    pub fn storage(&self) -> &'a dyn StorageBackend {
        self.storage
    }

    #[must_use]
    pub fn files(&self) -> &'a dyn FileOps {
        self.files
    }

    #[must_use]
    pub fn tally(&self) -> &ActionTally {
        &self.tally
    }

    #[must_use]
    pub fn into_tally(self) -> ActionTally {
        self.tally
    }

    fn dry_run(&self) -> bool {
        self.mode.is_dry_run()
    }

    fn entry(&self, event: EventType) -> LogEntry {
        LogEntry::new(event, Severity::Info, self.dry_run()).pool(&self.pool)
    }

    /// Record a failure in the audit log and hand it back.
    fn fail(&mut self, err: ZscError, snapshot: Option<&str>) -> ZscError {
        let mut entry = LogEntry::new(EventType::Error, Severity::Critical, self.dry_run())
            .pool(&self.pool)
            .error(&err);
        if let Some(name) = snapshot {
            entry = entry.snapshot(name);
        }
        self.audit.record(&entry);
        tracing::error!(code = err.code(), "{err}");
        err
    }

    // ──────────────────── storage ────────────────────

    /// Place the keep hold on a snapshot.
    pub fn hold(&mut self, snapshot: &str) -> Result<()> {
        let line = render_command(self.storage.program(), &hold_args(snapshot, KEEP_TAG));
        tracing::info!("{line}");
        if !self.dry_run()
            && let Err(err) = self.storage.hold(snapshot, KEEP_TAG)
        {
            return Err(self.fail(err, Some(snapshot)));
        }
        let entry = self.entry(EventType::HoldPlaced).snapshot(snapshot).details(line);
        self.audit.record(&entry);
        self.tally.holds_placed.push(snapshot.to_string());
        Ok(())
    }

    /// Release the keep hold of a snapshot.
    pub fn release(&mut self, snapshot: &str) -> Result<()> {
        let line = render_command(self.storage.program(), &release_args(snapshot, KEEP_TAG));
        tracing::info!("{line}");
        if !self.dry_run()
            && let Err(err) = self.storage.release(snapshot, KEEP_TAG)
        {
            return Err(self.fail(err, Some(snapshot)));
        }
        let entry = self.entry(EventType::HoldReleased).snapshot(snapshot).details(line);
        self.audit.record(&entry);
        self.tally.holds_released.push(snapshot.to_string());
        Ok(())
    }

    /// Destroy a live snapshot and transition it in the model.
    ///
    /// The model is only updated once the storage call succeeded (or was
    /// previewed). Returns the bytes accounted to the snapshot.
    pub fn destroy_snapshot(&mut self, pool: &mut Pool, id: SnapshotId) -> Result<u64> {
        let (name, size, dataset) = {
            let snapshot = pool.ensure_active(id)?;
            (
                snapshot.name.clone(),
                snapshot.used,
                pool.dataset(snapshot.dataset).name.clone(),
            )
        };
        let line = render_command(self.storage.program(), &destroy_args(&name));
        tracing::info!("{line}");
        if !self.dry_run() {
            if let Err(err) = self.storage.destroy(&name) {
                return Err(self.fail(err, Some(&name)));
            }
            tracing::info!("snapshot '{name}' has been destroyed");
        }
        let freed = pool.mark_destroyed(id)?;
        let entry = self
            .entry(EventType::SnapshotDestroy)
            .dataset(dataset)
            .snapshot(&name)
            .size(size);
        self.audit.record(&entry);
        self.tally.destroyed.push(name);
        Ok(freed)
    }

    // ──────────────────── files ────────────────────

    /// Delete every regular file under `root` admitted by `filter`.
    pub fn delete_files(&mut self, root: &Path, filter: AgeFilter) -> Result<()> {
        tracing::info!(
            "find {} -type f {} -delete",
            root.display(),
            filter.describe()
        );
        let mut entries = match self.files.list_files(root, filter) {
            Ok(entries) => entries,
            Err(err) => return Err(self.fail(err, None)),
        };
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        for entry in entries {
            if self.dry_run() {
                tracing::debug!("file '{}' would be deleted", entry.path.display());
            } else {
                if let Err(err) = self.files.delete(&entry.path) {
                    return Err(self.fail(err, None));
                }
                tracing::info!("file '{}' has been deleted", entry.path.display());
            }
            let record = self
                .entry(EventType::FileDelete)
                .path(&entry.path)
                .size(Some(entry.size));
            self.audit.record(&record);
            self.tally.files_deleted += 1;
            self.tally.file_bytes_deleted = self.tally.file_bytes_deleted.saturating_add(entry.size);
        }
        Ok(())
    }

    /// Remove empty directories below `root` admitted by `filter`.
    ///
    /// Previewed runs delete no files, so there is nothing to sweep: the
    /// command is logged only.
    pub fn delete_empty_dirs(&mut self, root: &Path, filter: AgeFilter) -> Result<Vec<PathBuf>> {
        tracing::info!(
            "find {} -mindepth 1 -type d {} -empty -delete",
            root.display(),
            filter.describe()
        );
        if self.dry_run() {
            return Ok(Vec::new());
        }
        let removed = match self.files.delete_empty_dirs(root, filter) {
            Ok(removed) => removed,
            Err(err) => return Err(self.fail(err, None)),
        };
        for dir in &removed {
            tracing::info!("directory '{}' has been deleted", dir.display());
            let entry = self.entry(EventType::DirectoryDelete).path(dir);
            self.audit.record(&entry);
        }
        self.tally.dirs_deleted += removed.len();
        Ok(removed)
    }
}
