#![forbid(unsafe_code)]

//! ZFS snapshot cleaner (zsc): policy-driven snapshot retention and
//! capacity-driven eviction for ZFS pools.
//!
//! A run is one batch pass per configured pool:
//! 1. **Discovery**: the dataset/snapshot forest is built from one recursive
//!    property listing
//! 2. **Retention**: every snapshot gets a memoized keep verdict, and the
//!    persisted `keep` hold is reconciled with it
//! 3. **Pruning**: snapshots outside max-retention are destroyed, and old
//!    files are removed from filesystem datasets by age and by quota
//! 4. **Eviction**: while the pool is over its capacity threshold, one
//!    destroyable snapshot at a time is destroyed
//!
//! Preview runs share every decision with real runs; they only simulate the
//! accounting and log commands instead of issuing them.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use zfs_snapshot_cleaner::prelude::*;
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod model;
pub mod platform;
pub mod policy;
pub mod reaper;
