//! Build a [`Pool`] from a flat, order-dependent property listing.
//!
//! The listing groups rows by entity: a dataset's rows, then the rows of each
//! of its snapshots, then the next dataset. The parser keeps only a name index
//! and the entity whose rows are currently being read.

#![allow(missing_docs)]

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveDateTime};

use crate::core::errors::{Result, ZscError};
use crate::model::accounting::{RunMode, SpaceAccounting};
use crate::model::hierarchy::{Dataset, DatasetId, DatasetKind, Pool, Snapshot, SnapshotId};
use crate::platform::zfs::{PropertyRow, StorageBackend, parse_numeric};

/// Properties requested for discovery.
pub const DISCOVERY_PROPERTIES: &[&str] = &[
    "type",
    "creation",
    "used",
    "available",
    "referenced",
    "userrefs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Current {
    Nothing,
    Dataset(DatasetId),
    Snapshot(SnapshotId),
    /// An entity of a type the model does not track (bookmark, ...).
    Skipped,
}

struct ListingParser {
    pool: Pool,
    by_name: HashMap<String, DatasetId>,
    current: Current,
    current_name: String,
}

impl ListingParser {
    fn new(pool: Pool) -> Self {
        Self {
            pool,
            by_name: HashMap::new(),
            current: Current::Nothing,
            current_name: String::new(),
        }
    }

    fn feed(&mut self, row: &PropertyRow) -> Result<()> {
        if row.property == "type" {
            return self.begin(row);
        }
        if row.entity != self.current_name {
            return Err(ZscError::Discovery {
                details: format!(
                    "property {} of {} arrived before its type row",
                    row.property, row.entity
                ),
            });
        }
        match self.current {
            Current::Dataset(id) => apply_dataset(self.pool.dataset_mut(id), row),
            Current::Snapshot(id) => apply_snapshot(self.pool.snapshot_mut(id), row),
            Current::Nothing | Current::Skipped => {}
        }
        Ok(())
    }

    fn begin(&mut self, row: &PropertyRow) -> Result<()> {
        self.current_name.clone_from(&row.entity);
        if row.value == "snapshot" {
            let owner = self.owner_of(&row.entity)?;
            let id = self.pool.add_snapshot(Snapshot::new(&row.entity, owner));
            self.current = Current::Snapshot(id);
            return Ok(());
        }
        let Some(kind) = DatasetKind::from_type(&row.value) else {
            tracing::debug!(entity = %row.entity, kind = %row.value, "skipping untracked entity type");
            self.current = Current::Skipped;
            return Ok(());
        };
        let parent = self.parent_of(&row.entity);
        let id = self
            .pool
            .add_dataset(Dataset::new(&row.entity, kind, parent));
        self.by_name.insert(row.entity.clone(), id);
        self.current = Current::Dataset(id);
        Ok(())
    }

    /// Nearest already-seen ancestor by name nesting.
    fn parent_of(&self, name: &str) -> Option<DatasetId> {
        let mut cursor = name;
        while let Some((head, _)) = cursor.rsplit_once('/') {
            if let Some(id) = self.by_name.get(head) {
                return Some(*id);
            }
            cursor = head;
        }
        None
    }

    /// Dataset owning a snapshot: the `@`-stripped name, else the most recent
    /// dataset of the listing.
    fn owner_of(&self, snapshot: &str) -> Result<DatasetId> {
        let orphan = || ZscError::OrphanSnapshot {
            name: snapshot.to_string(),
        };
        let (dataset, _) = snapshot.split_once('@').ok_or_else(orphan)?;
        if let Some(id) = self.by_name.get(dataset) {
            return Ok(*id);
        }
        match self.current {
            Current::Dataset(id) => Ok(id),
            Current::Snapshot(id) => Ok(self.pool.snapshot(id).dataset),
            Current::Nothing | Current::Skipped => Err(orphan()),
        }
    }
}

fn apply_dataset(dataset: &mut Dataset, row: &PropertyRow) {
    let value = parse_numeric(&row.value);
    match row.property.as_str() {
        "used" => dataset.used = value,
        "available" => dataset.available = value,
        "referenced" => dataset.referenced = value,
        _ => {}
    }
}

fn apply_snapshot(snapshot: &mut Snapshot, row: &PropertyRow) {
    match row.property.as_str() {
        "creation" => snapshot.creation = parse_epoch(&row.value),
        "used" => snapshot.used = parse_numeric(&row.value),
        "referenced" => snapshot.referenced = parse_numeric(&row.value),
        "userrefs" => snapshot.userrefs = parse_numeric(&row.value),
        _ => {}
    }
}

/// Epoch seconds to local wall-clock time.
fn parse_epoch(value: &str) -> Option<NaiveDateTime> {
    let secs: i64 = value.parse().ok()?;
    DateTime::from_timestamp(secs, 0).map(|t| t.with_timezone(&Local).naive_local())
}

/// Build the forest for `pool_name` from an already-fetched listing.
///
/// Pool used/available come from the root dataset's rows.
pub fn build_pool(pool_name: &str, mode: RunMode, rows: &[PropertyRow]) -> Result<Pool> {
    let mut parser = ListingParser::new(Pool::new(
        pool_name,
        SpaceAccounting::new(mode, pool_name, 0, 0),
    ));
    for row in rows {
        parser.feed(row)?;
    }
    let mut pool = parser.pool;
    let root = pool
        .dataset_by_name(pool_name)
        .ok_or_else(|| ZscError::UnknownEntity {
            name: pool_name.to_string(),
        })?;
    let (used, available) = {
        let root = pool.dataset(root);
        (root.used.unwrap_or(0), root.available.unwrap_or(0))
    };
    pool.accounting = SpaceAccounting::new(mode, pool_name, used, available);
    Ok(pool)
}

/// Query the storage backend and build the forest for `pool_name`.
pub fn discover(storage: &dyn StorageBackend, pool_name: &str, mode: RunMode) -> Result<Pool> {
    tracing::info!(pool = pool_name, "getting datasets information, this may take a while");
    let rows = storage.get(pool_name, DISCOVERY_PROPERTIES, true)?;
    let pool = build_pool(pool_name, mode, &rows)?;
    tracing::debug!(
        pool = pool_name,
        datasets = pool.dataset_ids().count(),
        snapshots = pool.snapshot_count(),
        "discovery complete"
    );
    Ok(pool)
}
