//! Pool / dataset / snapshot forest.
//!
//! Datasets and snapshots live in two arenas owned by the [`Pool`] and refer
//! to each other by index: a dataset lists its snapshot ids in creation order
//! and points at its parent dataset; a snapshot points back at its dataset.
//! Nothing is ever removed from the arenas. Destroying a snapshot flips its
//! state and drops its id from the owning dataset's list.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::core::errors::{Result, ZscError};
use crate::model::accounting::SpaceAccounting;
use crate::platform::zfs::StorageBackend;
use crate::policy::keep::KeepVerdict;
use crate::policy::rules::{EMPTY_RULES, MaxFileAge, RuleSet};
use crate::reaper::eviction::TieBreak;

/// Default pool capacity threshold.
pub const DEFAULT_MAX_CAPACITY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Volume,
}

impl DatasetKind {
    #[must_use]
    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "filesystem" => Some(Self::Filesystem),
            "volume" => Some(Self::Volume),
            _ => None,
        }
    }
}

/// Settings attached to a dataset from configuration. `None` inherits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetPolicy {
    pub retention_policy: Option<RuleSet>,
    pub max_retention: Option<RuleSet>,
    pub max_file_age: Option<MaxFileAge>,
    pub max_capacity: Option<f64>,
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
    pub parent: Option<DatasetId>,
    pub used: Option<u64>,
    pub available: Option<u64>,
    pub referenced: Option<u64>,
    /// Live snapshots, oldest first.
    pub snapshots: Vec<SnapshotId>,
    pub policy: DatasetPolicy,
}

impl Dataset {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: DatasetKind, parent: Option<DatasetId>) -> Self {
        Self {
            name: name.into(),
            kind,
            parent,
            used: None,
            available: None,
            referenced: None,
            snapshots: Vec::new(),
            policy: DatasetPolicy::default(),
        }
    }

    /// Configured mount point, else `/<name>`.
    #[must_use]
    pub fn mount_point(&self) -> PathBuf {
        self.policy
            .mount_point
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/{}", self.name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Active,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub dataset: DatasetId,
    pub creation: Option<NaiveDateTime>,
    pub used: Option<u64>,
    pub referenced: Option<u64>,
    pub userrefs: Option<u64>,
    /// Persisted holds, fetched on first use.
    pub tags: Option<BTreeSet<String>>,
    /// Memoized keep verdict for this run.
    pub verdict: Option<KeepVerdict>,
    pub state: SnapshotState,
}

impl Snapshot {
    #[must_use]
    pub fn new(name: impl Into<String>, dataset: DatasetId) -> Self {
        Self {
            name: name.into(),
            dataset,
            creation: None,
            used: None,
            referenced: None,
            userrefs: None,
            tags: None,
            verdict: None,
            state: SnapshotState::Active,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SnapshotState::Active
    }

    /// Text after `@`.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.split_once('@').map_or(&self.name, |(_, s)| s)
    }
}

/// Pool-wide eviction settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSettings {
    pub max_capacity: f64,
    pub tie_break: TieBreak,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            tie_break: TieBreak::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub settings: PoolSettings,
    pub accounting: SpaceAccounting,
    datasets: Vec<Dataset>,
    snapshots: Vec<Snapshot>,
}

impl Pool {
    #[must_use]
    pub fn new(name: impl Into<String>, accounting: SpaceAccounting) -> Self {
        Self {
            name: name.into(),
            settings: PoolSettings::default(),
            accounting,
            datasets: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    // ──────────────────── construction ────────────────────

    pub fn add_dataset(&mut self, dataset: Dataset) -> DatasetId {
        self.datasets.push(dataset);
        DatasetId(self.datasets.len() - 1)
    }

    /// Append a snapshot to its dataset's list (listing order is creation order).
    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> SnapshotId {
        let id = SnapshotId(self.snapshots.len());
        let owner = snapshot.dataset;
        self.snapshots.push(snapshot);
        self.datasets[owner.0].snapshots.push(id);
        id
    }

    // ──────────────────── lookup ────────────────────

    #[must_use]
    pub fn dataset(&self, id: DatasetId) -> &Dataset {
        &self.datasets[id.0]
    }

    pub fn dataset_mut(&mut self, id: DatasetId) -> &mut Dataset {
        &mut self.datasets[id.0]
    }

    #[must_use]
    pub fn snapshot(&self, id: SnapshotId) -> &Snapshot {
        &self.snapshots[id.0]
    }

    pub fn snapshot_mut(&mut self, id: SnapshotId) -> &mut Snapshot {
        &mut self.snapshots[id.0]
    }

    /// Dataset ids in discovery order.
    pub fn dataset_ids(&self) -> impl Iterator<Item = DatasetId> + use<> {
        (0..self.datasets.len()).map(DatasetId)
    }

    pub fn datasets(&self) -> impl Iterator<Item = (DatasetId, &Dataset)> {
        self.datasets.iter().enumerate().map(|(i, d)| (DatasetId(i), d))
    }

    /// Linear scan by full name.
    #[must_use]
    pub fn dataset_by_name(&self, name: &str) -> Option<DatasetId> {
        self.datasets
            .iter()
            .position(|d| d.name == name)
            .map(DatasetId)
    }

    /// Live snapshots of every dataset, dataset by dataset, oldest first.
    pub fn live_snapshots(&self) -> Vec<SnapshotId> {
        self.datasets
            .iter()
            .flat_map(|d| d.snapshots.iter().copied())
            .collect()
    }

    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.datasets.iter().map(|d| d.snapshots.len()).sum()
    }

    // ──────────────────── inheritance ────────────────────

    /// Nearest value along the parent chain starting at `id` itself.
    fn resolve<T: ?Sized>(
        &self,
        id: DatasetId,
        pick: impl Fn(&DatasetPolicy) -> Option<&T>,
    ) -> Option<&T> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let dataset = &self.datasets[current.0];
            if let Some(value) = pick(&dataset.policy) {
                return Some(value);
            }
            cursor = dataset.parent;
        }
        None
    }

    #[must_use]
    pub fn effective_retention_policy(&self, id: DatasetId) -> &RuleSet {
        self.resolve(id, |p| p.retention_policy.as_ref())
            .unwrap_or(&EMPTY_RULES)
    }

    #[must_use]
    pub fn effective_max_retention(&self, id: DatasetId) -> &RuleSet {
        self.resolve(id, |p| p.max_retention.as_ref())
            .unwrap_or(&EMPTY_RULES)
    }

    #[must_use]
    pub fn effective_max_file_age(&self, id: DatasetId) -> Option<MaxFileAge> {
        self.resolve(id, |p| p.max_file_age.as_ref()).copied()
    }

    #[must_use]
    pub fn effective_max_capacity(&self, id: DatasetId) -> Option<f64> {
        self.resolve(id, |p| p.max_capacity.as_ref()).copied()
    }

    // ──────────────────── accounting ────────────────────

    pub fn used(&self, storage: &dyn StorageBackend) -> Result<u64> {
        self.accounting.used(storage)
    }

    pub fn available(&self, storage: &dyn StorageBackend) -> Result<u64> {
        self.accounting.available(storage)
    }

    pub fn capacity(&self, storage: &dyn StorageBackend) -> Result<f64> {
        self.accounting.capacity(storage)
    }

    /// Sum of every dataset's referenced bytes ("used by data").
    pub fn referenced(&self, storage: &dyn StorageBackend) -> Result<u64> {
        let mut total = 0u64;
        for dataset in &self.datasets {
            let referenced = if self.accounting.mode().is_dry_run() {
                dataset.referenced
            } else {
                storage.get_u64(&dataset.name, "referenced")?
            };
            total = total.saturating_add(referenced.unwrap_or(0));
        }
        Ok(total)
    }

    /// Transition a snapshot from active to destroyed.
    ///
    /// Removes it from its dataset's list and updates accounting in one step.
    /// Returns the snapshot's used bytes.
    pub fn mark_destroyed(&mut self, id: SnapshotId) -> Result<u64> {
        let snapshot = &mut self.snapshots[id.0];
        if snapshot.state == SnapshotState::Destroyed {
            return Err(ZscError::SnapshotDestroyed {
                name: snapshot.name.clone(),
            });
        }
        snapshot.state = SnapshotState::Destroyed;
        let size = snapshot.used.unwrap_or(0);
        let owner = snapshot.dataset;
        self.datasets[owner.0].snapshots.retain(|s| *s != id);
        self.accounting.record_destroyed(size);
        Ok(size)
    }

    /// Fail if the snapshot has already been destroyed.
    pub fn ensure_active(&self, id: SnapshotId) -> Result<&Snapshot> {
        let snapshot = self.snapshot(id);
        if snapshot.is_active() {
            Ok(snapshot)
        } else {
            Err(ZscError::SnapshotDestroyed {
                name: snapshot.name.clone(),
            })
        }
    }
}
