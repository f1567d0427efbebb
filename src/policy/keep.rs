//! Tri-state keep decision and its reconciliation with the persisted hold.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::errors::Result;
use crate::model::hierarchy::{DatasetId, Pool, SnapshotId};
use crate::policy::rules::RuleSet;
use crate::reaper::executor::ActionExecutor;

/// Hold tag recording a must-keep decision.
pub const KEEP_TAG: &str = "keep";

/// Per-snapshot verdict for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepVerdict {
    /// Matched the retention policy: never destroyed.
    Keep,
    /// Outside every max-retention clause: destroyed unconditionally.
    Destroy,
    /// Neither: destroyed only under capacity pressure.
    BestEffort,
}

impl KeepVerdict {
    /// Eligible for capacity-driven eviction.
    #[must_use]
    pub const fn is_destroyable(self) -> bool {
        !matches!(self, Self::Keep)
    }

    #[must_use]
    pub const fn status_label(self) -> &'static str {
        match self {
            Self::Keep => "must NOT be destroyed",
            Self::Destroy => "must be destroyed",
            Self::BestEffort => "can be destroyed",
        }
    }
}

/// Combine max-retention and retention policy into a verdict.
///
/// A non-empty max-retention set defaults to [`KeepVerdict::Destroy`] and the
/// first matching clause relaxes it to best effort. A matching retention
/// clause always wins.
#[must_use]
pub fn decide(
    max_retention: &RuleSet,
    retention_policy: &RuleSet,
    name: &str,
    created: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> KeepVerdict {
    let mut verdict = KeepVerdict::BestEffort;

    if !max_retention.is_empty() {
        verdict = match max_retention.first_match(name, created, now) {
            Some(rule) => {
                tracing::debug!(snapshot = name, clause = %rule, "matches maxRetention, may keep it");
                KeepVerdict::BestEffort
            }
            None => {
                tracing::debug!(snapshot = name, "matches no maxRetention clause, must destroy it");
                KeepVerdict::Destroy
            }
        };
    }

    if let Some(rule) = retention_policy.first_match(name, created, now) {
        tracing::debug!(snapshot = name, clause = %rule, "matches retentionPolicy, have to keep it");
        verdict = KeepVerdict::Keep;
    }

    verdict
}

/// Computes verdicts once per snapshot per run and syncs the keep hold.
#[derive(Debug, Clone, Copy)]
pub struct KeepEngine {
    now: NaiveDateTime,
}

impl KeepEngine {
    #[must_use]
    pub const fn new(now: NaiveDateTime) -> Self {
        Self { now }
    }

    #[must_use]
    pub const fn now(&self) -> NaiveDateTime {
        self.now
    }

    /// Memoized verdict for a live snapshot.
    ///
    /// The first call evaluates the effective rule sets, then places the keep
    /// hold if the verdict is [`KeepVerdict::Keep`] and it is absent, or
    /// releases it if the verdict is anything else and it is present. Later
    /// calls return the cached verdict without touching storage.
    pub fn verdict(
        &self,
        pool: &mut Pool,
        id: SnapshotId,
        exec: &mut ActionExecutor<'_>,
    ) -> Result<KeepVerdict> {
        let snapshot = pool.ensure_active(id)?;
        if let Some(verdict) = snapshot.verdict {
            return Ok(verdict);
        }

        let dataset = snapshot.dataset;
        let verdict = decide(
            pool.effective_max_retention(dataset),
            pool.effective_retention_policy(dataset),
            &snapshot.name,
            snapshot.creation,
            self.now,
        );

        let held = tags(pool, id, exec)?.contains(KEEP_TAG);
        let name = pool.snapshot(id).name.clone();
        match (verdict, held) {
            (KeepVerdict::Keep, false) => {
                exec.hold(&name)?;
                let snapshot = pool.snapshot_mut(id);
                snapshot.tags.get_or_insert_default().insert(KEEP_TAG.to_string());
                snapshot.userrefs = Some(snapshot.userrefs.unwrap_or(0) + 1);
            }
            (KeepVerdict::Destroy | KeepVerdict::BestEffort, true) => {
                exec.release(&name)?;
                let snapshot = pool.snapshot_mut(id);
                if let Some(tags) = snapshot.tags.as_mut() {
                    tags.remove(KEEP_TAG);
                }
                snapshot.userrefs = Some(snapshot.userrefs.unwrap_or(1).saturating_sub(1));
            }
            _ => {}
        }

        pool.snapshot_mut(id).verdict = Some(verdict);
        Ok(verdict)
    }

    /// Live snapshots of a dataset that may be evicted, oldest first.
    pub fn destroyable(
        &self,
        pool: &mut Pool,
        dataset: DatasetId,
        exec: &mut ActionExecutor<'_>,
    ) -> Result<Vec<SnapshotId>> {
        let ids = pool.dataset(dataset).snapshots.clone();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if self.verdict(pool, id, exec)?.is_destroyable() {
                out.push(id);
            }
        }
        Ok(out)
    }
}

/// Persisted tags of a snapshot, fetched on first use.
///
/// Skips the query when the user-reference count is known to be zero.
pub fn tags<'p>(
    pool: &'p mut Pool,
    id: SnapshotId,
    exec: &ActionExecutor<'_>,
) -> Result<&'p BTreeSet<String>> {
    if pool.snapshot(id).tags.is_none() {
        let snapshot = pool.snapshot(id);
        let fetched: BTreeSet<String> = if snapshot.userrefs == Some(0) {
            BTreeSet::new()
        } else {
            exec.storage().list_tags(&snapshot.name)?.into_iter().collect()
        };
        let snapshot = pool.snapshot_mut(id);
        snapshot.userrefs = Some(fetched.len() as u64);
        snapshot.tags = Some(fetched);
    }
    Ok(pool.snapshot_mut(id).tags.get_or_insert_default())
}
