//! File-level pruning for filesystem datasets: an age pass and a capacity
//! pass, both independent of snapshot retention.
//!
//! The capacity pass never deletes file by file while re-querying usage.
//! It simulates deleting the oldest files until usage would fall under the
//! threshold, takes the modification date of the last file that simulation
//! needed, and deletes everything modified on or before that date.

#![allow(missing_docs)]

use std::path::PathBuf;

use crate::core::errors::Result;
use crate::model::hierarchy::{DatasetId, DatasetKind, Pool};
use crate::platform::files::{AgeFilter, FileEntry};
use crate::platform::zfs::PropertyRow;
use crate::reaper::executor::ActionExecutor;

/// Properties the capacity pass needs.
pub const QUOTA_PROPERTIES: &[&str] = &["used", "refquota", "quota"];

/// Usage and quota of one dataset. Zero quotas mean "none".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaInfo {
    pub used: Option<u64>,
    pub refquota: Option<u64>,
    pub quota: Option<u64>,
}

impl QuotaInfo {
    #[must_use]
    pub fn from_rows(rows: &[PropertyRow]) -> Self {
        let mut info = Self::default();
        for row in rows {
            match row.property.as_str() {
                "used" => info.used = row.value_u64(),
                "refquota" => info.refquota = row.value_u64(),
                "quota" => info.quota = row.value_u64(),
                _ => {}
            }
        }
        info
    }

    /// `refquota` when set, else `quota`.
    #[must_use]
    pub fn effective_quota(&self) -> Option<u64> {
        self.refquota
            .filter(|q| *q > 0)
            .or_else(|| self.quota.filter(|q| *q > 0))
    }
}

/// Bytes to free so that usage ends strictly under `fraction × quota`.
///
/// `None` when usage is already at or under the threshold.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn needed_reduction(used: u64, quota: u64, fraction: f64) -> Option<u64> {
    let threshold = fraction * quota as f64;
    let used_f = used as f64;
    if used_f <= threshold {
        return None;
    }
    Some((used_f - threshold).floor() as u64 + 1)
}

/// The file at which the cumulative size of `sorted` (oldest first) reaches
/// `needed`, or the last file if it never does.
#[must_use]
pub fn capacity_cutoff(sorted: &[FileEntry], needed: u64) -> Option<&FileEntry> {
    let mut freed = 0u64;
    for entry in sorted {
        freed = freed.saturating_add(entry.size);
        if freed >= needed {
            return Some(entry);
        }
    }
    sorted.last()
}

/// Mount point of a filesystem dataset that exists on disk.
fn mounted_filesystem(pool: &Pool, id: DatasetId, exec: &ActionExecutor<'_>) -> Option<PathBuf> {
    let dataset = pool.dataset(id);
    if dataset.kind != DatasetKind::Filesystem {
        return None;
    }
    let mount = dataset.mount_point();
    if !exec.files().is_dir(&mount) {
        tracing::debug!(dataset = %dataset.name, mount = %mount.display(), "mount point missing, skipping");
        return None;
    }
    Some(mount)
}

/// Delete files (and then empty directories) whose change time is older
/// than the dataset's max file age.
pub fn prune_by_age(pool: &Pool, id: DatasetId, exec: &mut ActionExecutor<'_>) -> Result<()> {
    let Some(max_age) = pool.effective_max_file_age(id) else {
        return Ok(());
    };
    let Some(mount) = mounted_filesystem(pool, id, exec) else {
        return Ok(());
    };
    tracing::debug!(dataset = %pool.dataset(id).name, max_age = %max_age, "age pass");
    let filter = AgeFilter::ChangedOlderThanDays(max_age.days());
    exec.delete_files(&mount, filter)?;
    exec.delete_empty_dirs(&mount, filter)?;
    Ok(())
}

/// Delete the oldest files until the dataset is back under its capacity
/// fraction of quota.
pub fn prune_by_capacity(pool: &Pool, id: DatasetId, exec: &mut ActionExecutor<'_>) -> Result<()> {
    let Some(fraction) = pool.effective_max_capacity(id) else {
        return Ok(());
    };
    let Some(mount) = mounted_filesystem(pool, id, exec) else {
        return Ok(());
    };
    let name = &pool.dataset(id).name;
    let info = QuotaInfo::from_rows(&exec.storage().get(name, QUOTA_PROPERTIES, false)?);
    let (Some(used), Some(quota)) = (info.used, info.effective_quota()) else {
        tracing::debug!(dataset = %name, "no usage or quota, skipping capacity pass");
        return Ok(());
    };
    let Some(needed) = needed_reduction(used, quota, fraction) else {
        tracing::debug!(dataset = %name, used, quota, fraction, "under threshold");
        return Ok(());
    };
    tracing::debug!(dataset = %name, used, quota, fraction, needed, "over threshold");

    let mut files = exec.files().list_files(&mount, AgeFilter::Any)?;
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    let Some(cutoff) = capacity_cutoff(&files, needed) else {
        return Ok(());
    };
    let date = cutoff.modified.date();
    tracing::debug!(dataset = %name, cutoff = %cutoff.path.display(), %date, "capacity cutoff");

    let filter = AgeFilter::ModifiedOnOrBefore(date);
    exec.delete_files(&mount, filter)?;
    exec.delete_empty_dirs(&mount, filter)?;
    Ok(())
}
