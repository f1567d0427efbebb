//! Destructive side of a run: action execution, file pruning, eviction, and
//! the per-pool batch pass tying them together.

pub mod eviction;
pub mod executor;
pub mod pruner;
pub mod run;
