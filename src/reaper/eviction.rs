//! Capacity-pressure eviction: destroy one snapshot at a time, chosen across
//! all datasets by a tie-break policy, until the pool is under threshold or
//! nothing destroyable is left.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::errors::{Result, ZscError};
use crate::model::hierarchy::{DatasetId, Pool, SnapshotId};
use crate::policy::keep::KeepEngine;
use crate::reaper::executor::ActionExecutor;

/// Which dataset gives up its oldest destroyable snapshot next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TieBreak {
    /// Dataset whose oldest destroyable snapshot was created first.
    #[serde(rename = "oldest")]
    Oldest,
    /// Dataset with the most destroyable snapshots.
    #[default]
    #[serde(rename = "morerem")]
    MoreRemovable,
    /// Dataset whose oldest destroyable snapshot uses the most space.
    #[serde(rename = "biggest")]
    Biggest,
    /// Dataset with the most snapshots overall.
    #[serde(rename = "more")]
    More,
}

impl FromStr for TieBreak {
    type Err = ZscError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "oldest" => Ok(Self::Oldest),
            "morerem" | "more-removable" => Ok(Self::MoreRemovable),
            "biggest" => Ok(Self::Biggest),
            "more" => Ok(Self::More),
            other => Err(ZscError::UnknownTieBreak {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Oldest => "oldest",
            Self::MoreRemovable => "morerem",
            Self::Biggest => "biggest",
            Self::More => "more",
        })
    }
}

/// What the scheduler knows about one dataset with destroyable snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub dataset: DatasetId,
    /// Oldest destroyable snapshot: the one evicted if this dataset wins.
    pub first: SnapshotId,
    pub first_created: Option<NaiveDateTime>,
    pub first_used: Option<u64>,
    pub destroyable: usize,
    pub total: usize,
}

/// Unknown creation times sort after every known one.
fn created_before(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl TieBreak {
    /// Whether `challenger` strictly beats `best`.
    fn beats(self, challenger: &Candidate, best: &Candidate) -> bool {
        match self {
            Self::Oldest => created_before(challenger.first_created, best.first_created),
            Self::MoreRemovable => challenger.destroyable > best.destroyable,
            Self::Biggest => challenger.first_used.unwrap_or(0) > best.first_used.unwrap_or(0),
            Self::More => challenger.total > best.total,
        }
    }
}

/// Pick the winning candidate. Earlier candidates win ties.
#[must_use]
pub fn select_dataset(candidates: &[Candidate], tie_break: TieBreak) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates.iter().filter(|c| c.destroyable > 0) {
        best = match best {
            Some(current) if !tie_break.beats(candidate, current) => Some(current),
            _ => Some(candidate),
        };
    }
    best
}

/// How an eviction loop ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionOutcome {
    pub destroyed: usize,
    /// Still over threshold with nothing left to destroy.
    pub stopped_best_effort: bool,
}

fn candidates(
    pool: &mut Pool,
    engine: &KeepEngine,
    exec: &mut ActionExecutor<'_>,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    for dataset in pool.dataset_ids() {
        let destroyable = engine.destroyable(pool, dataset, exec)?;
        let Some(&first) = destroyable.first() else {
            continue;
        };
        let snapshot = pool.snapshot(first);
        out.push(Candidate {
            dataset,
            first,
            first_created: snapshot.creation,
            first_used: snapshot.used,
            destroyable: destroyable.len(),
            total: pool.dataset(dataset).snapshots.len(),
        });
    }
    Ok(out)
}

/// Destroy snapshots while the pool's capacity exceeds its threshold.
pub fn run_eviction(
    pool: &mut Pool,
    engine: &KeepEngine,
    exec: &mut ActionExecutor<'_>,
) -> Result<EvictionOutcome> {
    let storage = exec.storage();
    let threshold = pool.settings.max_capacity;
    let tie_break = pool.settings.tie_break;
    let mut outcome = EvictionOutcome::default();

    loop {
        let capacity = pool.capacity(storage)?;
        if capacity <= threshold {
            return Ok(outcome);
        }
        tracing::info!(
            pool = %pool.name,
            capacity,
            used = pool.used(storage)?,
            available = pool.available(storage)?,
            "pool over capacity threshold {threshold}"
        );

        let candidates = candidates(pool, engine, exec)?;
        let Some(winner) = select_dataset(&candidates, tie_break) else {
            tracing::warn!(
                pool = %pool.name,
                capacity,
                "no destroyable snapshot left, stopping above threshold"
            );
            outcome.stopped_best_effort = true;
            return Ok(outcome);
        };
        tracing::debug!(
            dataset = %pool.dataset(winner.dataset).name,
            %tie_break,
            destroyable = winner.destroyable,
            "selected for eviction"
        );
        exec.destroy_snapshot(pool, winner.first)?;
        outcome.destroyed += 1;
    }
}
