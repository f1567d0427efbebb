//! Pool space accounting: live queries in execute mode, local simulation in preview.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::errors::Result;
use crate::platform::zfs::StorageBackend;

/// Whether destructive calls are issued or only previewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Preview,
    Execute,
}

impl RunMode {
    #[must_use]
    pub const fn from_force(force: bool) -> Self {
        if force { Self::Execute } else { Self::Preview }
    }

    #[must_use]
    pub const fn is_dry_run(self) -> bool {
        matches!(self, Self::Preview)
    }
}

/// Used/available figures of one pool.
///
/// In [`RunMode::Execute`] every read goes to the storage backend, so the
/// figures reflect destroys that already happened. In [`RunMode::Preview`]
/// the discovery-time figures are adjusted locally for every simulated
/// destroy.
#[derive(Debug, Clone)]
pub struct SpaceAccounting {
    mode: RunMode,
    pool: String,
    used: u64,
    available: u64,
}

impl SpaceAccounting {
    #[must_use]
    pub fn new(mode: RunMode, pool: impl Into<String>, used: u64, available: u64) -> Self {
        Self {
            mode,
            pool: pool.into(),
            used,
            available,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn used(&self, storage: &dyn StorageBackend) -> Result<u64> {
        self.read(storage, "used", self.used)
    }

    pub fn available(&self, storage: &dyn StorageBackend) -> Result<u64> {
        self.read(storage, "available", self.available)
    }

    /// `used / (used + available)`; zero for an empty pool.
    pub fn capacity(&self, storage: &dyn StorageBackend) -> Result<f64> {
        let used = self.used(storage)?;
        let available = self.available(storage)?;
        Ok(capacity_fraction(used, available))
    }

    /// Reflect a destroyed snapshot of `size` bytes. No-op in execute mode.
    pub fn record_destroyed(&mut self, size: u64) {
        if self.mode == RunMode::Preview {
            self.used = self.used.saturating_sub(size);
            self.available = self.available.saturating_add(size);
        }
    }

    fn read(&self, storage: &dyn StorageBackend, property: &str, simulated: u64) -> Result<u64> {
        match self.mode {
            RunMode::Preview => Ok(simulated),
            RunMode::Execute => Ok(storage.get_u64(&self.pool, property)?.unwrap_or(simulated)),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn capacity_fraction(used: u64, available: u64) -> f64 {
    let total = used.saturating_add(available);
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64
}
