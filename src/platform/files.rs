//! Filesystem scan interface used by the file pruner.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

use crate::core::errors::{Result, ZscError};

/// A regular file found under a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Local modification time.
    pub modified: NaiveDateTime,
    /// Local inode change time.
    pub changed: NaiveDateTime,
    pub size: u64,
}

/// Which files (or directories) a scan admits, relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeFilter {
    Any,
    /// Change time more than `n` whole days ago.
    ChangedOlderThanDays(u32),
    /// Modification time more than `n` whole days ago.
    ModifiedOlderThanDays(u32),
    /// Modification date on or before the given local date.
    ModifiedOnOrBefore(NaiveDate),
}

impl AgeFilter {
    #[must_use]
    pub fn admits(self, modified: NaiveDateTime, changed: NaiveDateTime, now: NaiveDateTime) -> bool {
        match self {
            Self::Any => true,
            Self::ChangedOlderThanDays(n) => whole_days(changed, now) > i64::from(n),
            Self::ModifiedOlderThanDays(n) => whole_days(modified, now) > i64::from(n),
            Self::ModifiedOnOrBefore(date) => modified.date() <= date,
        }
    }

    /// `find`-style predicate, for logs.
    #[must_use]
    pub fn describe(self) -> String {
        match self {
            Self::Any => String::new(),
            Self::ChangedOlderThanDays(n) => format!("-ctime +{n}"),
            Self::ModifiedOlderThanDays(n) => format!("-mtime +{n}"),
            Self::ModifiedOnOrBefore(date) => format!("! -newermt {}", date.succ_opt().unwrap_or(date)),
        }
    }
}

/// Completed 24-hour periods between `then` and `now`; negative for future times.
fn whole_days(then: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (now - then).num_days()
}

/// Filesystem scan interface.
pub trait FileOps: Send + Sync {
    /// Regular files under `root` admitted by `filter`, unordered.
    fn list_files(&self, root: &Path, filter: AgeFilter) -> Result<Vec<FileEntry>>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Whether `path` is an existing directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Remove empty directories below `root` (never `root` itself) admitted by
    /// `filter`, deepest first. Returns the removed paths.
    fn delete_empty_dirs(&self, root: &Path, filter: AgeFilter) -> Result<Vec<PathBuf>>;
}

// ──────────────────── local filesystem ────────────────────

/// [`FileOps`] over the real filesystem. Symlinks are never followed.
#[derive(Debug, Clone, Copy)]
pub struct LocalFiles {
    now: NaiveDateTime,
}

impl LocalFiles {
    #[must_use]
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now }
    }

    fn walk(&self, dir: &Path, filter: AgeFilter, out: &mut Vec<FileEntry>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|source| ZscError::io(dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| ZscError::io(dir, source))?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path).map_err(|source| ZscError::io(&path, source))?;
            let file_type = meta.file_type();
            if file_type.is_dir() {
                self.walk(&path, filter, out)?;
            } else if file_type.is_file() {
                let (modified, changed) = times(&meta, &path)?;
                if filter.admits(modified, changed, self.now) {
                    out.push(FileEntry {
                        path,
                        modified,
                        changed,
                        size: meta.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn sweep(&self, dir: &Path, root: &Path, filter: AgeFilter, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|source| ZscError::io(dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| ZscError::io(dir, source))?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path).map_err(|source| ZscError::io(&path, source))?;
            if meta.file_type().is_dir() {
                self.sweep(&path, root, filter, out)?;
            }
        }
        if dir == root {
            return Ok(());
        }
        let is_empty = fs::read_dir(dir)
            .map_err(|source| ZscError::io(dir, source))?
            .next()
            .is_none();
        if !is_empty {
            return Ok(());
        }
        let meta = fs::symlink_metadata(dir).map_err(|source| ZscError::io(dir, source))?;
        let (modified, changed) = times(&meta, dir)?;
        if filter.admits(modified, changed, self.now) {
            fs::remove_dir(dir).map_err(|source| ZscError::io(dir, source))?;
            out.push(dir.to_path_buf());
        }
        Ok(())
    }
}

impl FileOps for LocalFiles {
    fn list_files(&self, root: &Path, filter: AgeFilter) -> Result<Vec<FileEntry>> {
        let mut out = Vec::new();
        self.walk(root, filter, &mut out)?;
        Ok(out)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|source| ZscError::io(path, source))
    }

    fn is_dir(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
    }

    fn delete_empty_dirs(&self, root: &Path, filter: AgeFilter) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        self.sweep(root, root, filter, &mut out)?;
        Ok(out)
    }
}

fn local_time(t: SystemTime) -> NaiveDateTime {
    DateTime::<Local>::from(t).naive_local()
}

fn times(meta: &fs::Metadata, path: &Path) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let modified = local_time(meta.modified().map_err(|source| ZscError::io(path, source))?);
    Ok((modified, change_time(meta).unwrap_or(modified)))
}

#[cfg(unix)]
fn change_time(meta: &fs::Metadata) -> Option<NaiveDateTime> {
    use std::os::unix::fs::MetadataExt;

    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    DateTime::from_timestamp(meta.ctime(), nanos).map(|t| t.with_timezone(&Local).naive_local())
}

#[cfg(not(unix))]
fn change_time(_meta: &fs::Metadata) -> Option<NaiveDateTime> {
    None
}

// ──────────────────── mock filesystem ────────────────────

#[derive(Debug, Clone, Copy)]
struct MockNode {
    is_dir: bool,
    modified: NaiveDateTime,
    changed: NaiveDateTime,
    size: u64,
}

/// In-memory [`FileOps`]. Parent directories are created implicitly.
#[derive(Debug)]
pub struct MockFiles {
    now: NaiveDateTime,
    nodes: Mutex<BTreeMap<PathBuf, MockNode>>,
    deleted: Mutex<Vec<PathBuf>>,
}

impl MockFiles {
    #[must_use]
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now,
            nodes: Mutex::new(BTreeMap::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Regular file modified (and changed) at `modified`.
    #[must_use]
    pub fn file(self, path: impl Into<PathBuf>, modified: NaiveDateTime, size: u64) -> Self {
        self.insert(path.into(), MockNode {
            is_dir: false,
            modified,
            changed: modified,
            size,
        });
        self
    }

    /// Directory with an explicit timestamp.
    #[must_use]
    pub fn dir(self, path: impl Into<PathBuf>, modified: NaiveDateTime) -> Self {
        self.insert(path.into(), MockNode {
            is_dir: true,
            modified,
            changed: modified,
            size: 0,
        });
        self
    }

    /// Paths deleted so far, in order.
    pub fn deleted(&self) -> Vec<PathBuf> {
        self.deleted.lock().clone()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.nodes.lock().contains_key(path)
    }

    fn insert(&self, path: PathBuf, node: MockNode) {
        let mut nodes = self.nodes.lock();
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() || nodes.contains_key(ancestor) {
                continue;
            }
            nodes.insert(ancestor.to_path_buf(), MockNode {
                is_dir: true,
                size: 0,
                ..node
            });
        }
        nodes.insert(path, node);
    }
}

impl FileOps for MockFiles {
    fn list_files(&self, root: &Path, filter: AgeFilter) -> Result<Vec<FileEntry>> {
        let nodes = self.nodes.lock();
        if !nodes.get(root).is_some_and(|n| n.is_dir) {
            return Err(ZscError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
            ));
        }
        Ok(nodes
            .iter()
            .filter(|(path, node)| !node.is_dir && path.starts_with(root))
            .filter(|(_, node)| filter.admits(node.modified, node.changed, self.now))
            .map(|(path, node)| FileEntry {
                path: path.clone(),
                modified: node.modified,
                changed: node.changed,
                size: node.size,
            })
            .collect())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(node) if !node.is_dir => {
                nodes.remove(path);
                self.deleted.lock().push(path.to_path_buf());
                Ok(())
            }
            _ => Err(ZscError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )),
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.nodes.lock().get(path).is_some_and(|n| n.is_dir)
    }

    fn delete_empty_dirs(&self, root: &Path, filter: AgeFilter) -> Result<Vec<PathBuf>> {
        let mut nodes = self.nodes.lock();
        let mut dirs: Vec<PathBuf> = nodes
            .iter()
            .filter(|(path, node)| node.is_dir && path.starts_with(root) && path.as_path() != root)
            .map(|(path, _)| path.clone())
            .collect();
        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        let mut removed = Vec::new();
        for dir in dirs {
            let has_children = nodes
                .keys()
                .any(|p| p.parent() == Some(dir.as_path()));
            let admitted = nodes
                .get(&dir)
                .is_some_and(|n| filter.admits(n.modified, n.changed, self.now));
            if !has_children && admitted {
                nodes.remove(&dir);
                removed.push(dir);
            }
        }
        self.deleted.lock().extend(removed.iter().cloned());
        Ok(removed)
    }
}
