//! In-memory storage model: hierarchy, discovery, and space accounting.

pub mod accounting;
pub mod discovery;
pub mod hierarchy;
