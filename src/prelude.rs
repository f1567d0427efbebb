//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use zfs_snapshot_cleaner::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, DatasetConfig, PoolConfig};
pub use crate::core::errors::{Result, ZscError};

// Logging
pub use crate::logger::ActivityLog;

// Model
pub use crate::model::accounting::RunMode;
pub use crate::model::discovery::discover;
pub use crate::model::hierarchy::{Dataset, DatasetId, DatasetKind, Pool, Snapshot, SnapshotId};

// Platform
pub use crate::platform::files::{AgeFilter, FileOps, LocalFiles, MockFiles};
pub use crate::platform::zfs::{MockStorage, StorageBackend, ZfsCommand};

// Policy
pub use crate::policy::keep::{KeepEngine, KeepVerdict};
pub use crate::policy::rules::{MaxFileAge, RetentionRule, RuleSet};

// Reaper
pub use crate::reaper::eviction::TieBreak;
pub use crate::reaper::run::{RunReport, Runner, SnapshotStatus};
