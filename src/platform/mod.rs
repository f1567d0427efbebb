//! External collaborators: the storage CLI and the filesystem.

pub mod files;
pub mod zfs;
