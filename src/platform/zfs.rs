//! Storage query/mutate interface, the `zfs` command backend, and an
//! in-memory mock for deterministic runs.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;

use chrono::{Local, NaiveDateTime, TimeZone};
use parking_lot::Mutex;

use crate::core::errors::{Result, ZscError};

/// Placeholder the storage CLI prints for an unavailable property.
pub const UNAVAILABLE: &str = "-";

/// One `(entity, property, value)` triple of a property listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRow {
    pub entity: String,
    pub property: String,
    pub value: String,
}

impl PropertyRow {
    #[must_use]
    pub fn new(entity: &str, property: &str, value: &str) -> Self {
        Self {
            entity: entity.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        }
    }

    /// Parse one line of `get -H -o name,property,value` output.
    ///
    /// Fields are tab separated; lines without tabs fall back to whitespace
    /// splitting. Returns `Ok(None)` for blank lines.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        let fields: Vec<&str> = if line.contains('\t') {
            line.splitn(3, '\t').collect()
        } else {
            line.split_whitespace().collect()
        };
        match fields.as_slice() {
            [entity, property, value] => Ok(Some(Self::new(entity, property, value.trim_end()))),
            _ => Err(ZscError::Discovery {
                details: format!("expected name, property and value: {line:?}"),
            }),
        }
    }

    /// Numeric value, `None` when unavailable or non-numeric.
    #[must_use]
    pub fn value_u64(&self) -> Option<u64> {
        parse_numeric(&self.value)
    }
}

/// Parse a `-p` numeric value, tolerating `-` and other placeholders.
#[must_use]
pub fn parse_numeric(value: &str) -> Option<u64> {
    if value == UNAVAILABLE {
        return None;
    }
    value.parse().ok()
}

// ──────────────────── interface ────────────────────

/// Storage query/mutate interface.
pub trait StorageBackend: Send + Sync {
    /// Program name used when rendering command lines for logs.
    fn program(&self) -> &str {
        "zfs"
    }

    /// Property listing for `entity` (and its descendants when `recursive`).
    fn get(&self, entity: &str, properties: &[&str], recursive: bool) -> Result<Vec<PropertyRow>>;

    fn destroy(&self, snapshot: &str) -> Result<()>;

    fn hold(&self, snapshot: &str, tag: &str) -> Result<()>;

    fn release(&self, snapshot: &str, tag: &str) -> Result<()>;

    fn list_tags(&self, snapshot: &str) -> Result<Vec<String>>;

    /// Single numeric property of one entity.
    fn get_u64(&self, entity: &str, property: &str) -> Result<Option<u64>> {
        Ok(self
            .get(entity, &[property], false)?
            .iter()
            .find(|row| row.entity == entity && row.property == property)
            .and_then(PropertyRow::value_u64))
    }
}

/// Arguments of each mutating storage call, shared by execution and preview logs.
pub fn destroy_args(snapshot: &str) -> Vec<String> {
    vec!["destroy".into(), "-d".into(), snapshot.into()]
}

pub fn hold_args(snapshot: &str, tag: &str) -> Vec<String> {
    vec!["hold".into(), tag.into(), snapshot.into()]
}

pub fn release_args(snapshot: &str, tag: &str) -> Vec<String> {
    vec!["release".into(), tag.into(), snapshot.into()]
}

/// `program arg1 arg2 ...` for logging.
#[must_use]
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

// ──────────────────── zfs command backend ────────────────────

/// Storage backend invoking the `zfs` CLI.
#[derive(Debug, Clone)]
pub struct ZfsCommand {
    binary: String,
}

impl Default for ZfsCommand {
    fn default() -> Self {
        Self::new("/sbin/zfs")
    }
}

impl ZfsCommand {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let command = render_command(&self.binary, args);
        tracing::trace!(%command, "running storage command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|source| ZscError::io(&self.binary, source))?;
        if !output.status.success() {
            return Err(ZscError::StorageCommand {
                command,
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|err| ZscError::StorageCommand {
            command,
            details: format!("non UTF-8 output: {err}"),
        })
    }
}

impl StorageBackend for ZfsCommand {
    fn program(&self) -> &str {
        &self.binary
    }

    fn get(&self, entity: &str, properties: &[&str], recursive: bool) -> Result<Vec<PropertyRow>> {
        let mut args: Vec<String> = vec!["get".into()];
        if recursive {
            args.push("-r".into());
        }
        args.extend(
            ["-H", "-p", "-o", "name,property,value"]
                .iter()
                .map(|s| (*s).to_string()),
        );
        args.push(properties.join(","));
        args.push(entity.to_string());

        let stdout = self.run(&args)?;
        let mut rows = Vec::new();
        for line in stdout.lines() {
            if let Some(row) = PropertyRow::parse_line(line)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn destroy(&self, snapshot: &str) -> Result<()> {
        self.run(&destroy_args(snapshot)).map(drop)
    }

    fn hold(&self, snapshot: &str, tag: &str) -> Result<()> {
        self.run(&hold_args(snapshot, tag)).map(drop)
    }

    fn release(&self, snapshot: &str, tag: &str) -> Result<()> {
        self.run(&release_args(snapshot, tag)).map(drop)
    }

    fn list_tags(&self, snapshot: &str) -> Result<Vec<String>> {
        let args = vec!["holds".to_string(), "-H".to_string(), snapshot.to_string()];
        let stdout = self.run(&args)?;
        Ok(parse_holds(&stdout))
    }
}

/// Tag column of `holds -H` output (`name<TAB>tag<TAB>timestamp`).
fn parse_holds(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = if line.contains('\t') {
                line.split('\t').collect::<Vec<_>>()
            } else {
                line.split_whitespace().collect::<Vec<_>>()
            }
            .into_iter();
            fields.next()?;
            fields.next().map(str::to_string)
        })
        .collect()
}

// ──────────────────── mock backend ────────────────────

/// A storage call observed by [`MockStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Get { entity: String, recursive: bool },
    Destroy(String),
    Hold { snapshot: String, tag: String },
    Release { snapshot: String, tag: String },
    ListTags(String),
}

impl StorageCall {
    /// Whether the call changes storage state.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Destroy(_) | Self::Hold { .. } | Self::Release { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct MockEntity {
    name: String,
    kind: &'static str,
    props: BTreeMap<String, String>,
    holds: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MockState {
    entities: Vec<MockEntity>,
    calls: Vec<StorageCall>,
    fail_on: Option<String>,
}

/// In-memory storage backend.
///
/// Entities are listed in insertion order, so build each dataset before its
/// snapshots and children. Destroy, hold and release mutate the mock's own
/// state: destroying a snapshot moves its `used` bytes from the pool root's
/// `used` to its `available`. Hold of an existing tag and release of a
/// missing tag fail, as the real CLI does.
#[derive(Debug, Default)]
pub struct MockStorage {
    state: Mutex<MockState>,
}

impl MockStorage {
    /// Pool root filesystem with the given space figures.
    #[must_use]
    pub fn new(pool: &str, used: u64, available: u64) -> Self {
        let mock = Self::default();
        mock.push(pool, "filesystem", &[
            ("used", used.to_string()),
            ("available", available.to_string()),
            ("referenced", "0".to_string()),
        ]);
        mock
    }

    #[must_use]
    pub fn filesystem(self, name: &str, referenced: u64) -> Self {
        self.push(name, "filesystem", &[
            ("used", referenced.to_string()),
            ("available", UNAVAILABLE.to_string()),
            ("referenced", referenced.to_string()),
        ]);
        self
    }

    #[must_use]
    pub fn volume(self, name: &str, referenced: u64) -> Self {
        self.push(name, "volume", &[
            ("used", referenced.to_string()),
            ("available", UNAVAILABLE.to_string()),
            ("referenced", referenced.to_string()),
        ]);
        self
    }

    /// Snapshot created at the given local time, occupying `used` bytes.
    #[must_use]
    pub fn snapshot(self, name: &str, created: NaiveDateTime, used: u64) -> Self {
        let epoch = Local
            .from_local_datetime(&created)
            .earliest()
            .map_or(0, |t| t.timestamp());
        self.push(name, "snapshot", &[
            ("creation", epoch.to_string()),
            ("used", used.to_string()),
            ("available", UNAVAILABLE.to_string()),
            ("referenced", used.to_string()),
        ]);
        self
    }

    /// Pre-existing hold on a snapshot.
    #[must_use]
    pub fn with_hold(self, snapshot: &str, tag: &str) -> Self {
        if let Some(entity) = self.state.lock().entities.iter_mut().find(|e| e.name == snapshot) {
            entity.holds.insert(tag.to_string());
        }
        self
    }

    /// Set or override an arbitrary property (quota, refquota, ...).
    #[must_use]
    pub fn with_property(self, entity: &str, property: &str, value: &str) -> Self {
        if let Some(e) = self.state.lock().entities.iter_mut().find(|e| e.name == entity) {
            e.props.insert(property.to_string(), value.to_string());
        }
        self
    }

    /// Make every call that names `entity` fail.
    #[must_use]
    pub fn failing_on(self, entity: &str) -> Self {
        self.state.lock().fail_on = Some(entity.to_string());
        self
    }

    /// Calls observed so far, in order.
    pub fn calls(&self) -> Vec<StorageCall> {
        self.state.lock().calls.clone()
    }

    /// Mutating calls observed so far.
    pub fn mutations(&self) -> Vec<StorageCall> {
        self.calls()
            .into_iter()
            .filter(StorageCall::is_mutation)
            .collect()
    }

    /// Names of snapshots still present.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.state
            .lock()
            .entities
            .iter()
            .filter(|e| e.kind == "snapshot")
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn holds_of(&self, snapshot: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .entities
            .iter()
            .find(|e| e.name == snapshot)
            .map(|e| e.holds.clone())
            .unwrap_or_default()
    }

    fn push(&self, name: &str, kind: &'static str, props: &[(&str, String)]) {
        let props = props
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        self.state.lock().entities.push(MockEntity {
            name: name.to_string(),
            kind,
            props,
            holds: BTreeSet::new(),
        });
    }
}

impl MockState {
    fn check(&self, command: &str, entity: &str) -> Result<()> {
        if self.fail_on.as_deref() == Some(entity) {
            return Err(ZscError::StorageCommand {
                command: command.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn find_mut(&mut self, command: &str, name: &str) -> Result<&mut MockEntity> {
        self.entities
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| ZscError::StorageCommand {
                command: command.to_string(),
                details: format!("cannot open '{name}': dataset does not exist"),
            })
    }

    fn value_of(entity: &MockEntity, property: &str) -> String {
        match property {
            "name" => entity.name.clone(),
            "type" => entity.kind.to_string(),
            "userrefs" if entity.kind == "snapshot" => entity.holds.len().to_string(),
            _ => entity
                .props
                .get(property)
                .cloned()
                .unwrap_or_else(|| UNAVAILABLE.to_string()),
        }
    }
}

fn is_descendant(candidate: &str, root: &str) -> bool {
    candidate == root
        || candidate
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
}

impl StorageBackend for MockStorage {
    fn get(&self, entity: &str, properties: &[&str], recursive: bool) -> Result<Vec<PropertyRow>> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Get {
            entity: entity.to_string(),
            recursive,
        });
        state.check("get", entity)?;
        if !state.entities.iter().any(|e| e.name == entity) {
            return Err(ZscError::StorageCommand {
                command: format!("zfs get {entity}"),
                details: format!("cannot open '{entity}': dataset does not exist"),
            });
        }
        let rows = state
            .entities
            .iter()
            .filter(|e| {
                if recursive {
                    is_descendant(&e.name, entity)
                } else {
                    e.name == entity
                }
            })
            .flat_map(|e| {
                properties
                    .iter()
                    .map(move |p| PropertyRow::new(&e.name, p, &MockState::value_of(e, p)))
            })
            .collect();
        Ok(rows)
    }

    fn destroy(&self, snapshot: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Destroy(snapshot.to_string()));
        let command = render_command("zfs", &destroy_args(snapshot));
        state.check(&command, snapshot)?;
        let idx = state
            .entities
            .iter()
            .position(|e| e.name == snapshot && e.kind == "snapshot")
            .ok_or_else(|| ZscError::StorageCommand {
                command: command.clone(),
                details: format!("could not find any snapshots to destroy: {snapshot}"),
            })?;
        if !state.entities[idx].holds.is_empty() {
            return Err(ZscError::StorageCommand {
                command,
                details: "dataset is busy".to_string(),
            });
        }
        let removed = state.entities.remove(idx);
        let size = removed
            .props
            .get("used")
            .and_then(|v| parse_numeric(v))
            .unwrap_or(0);
        if let Some(root) = state.entities.first_mut() {
            let used = root.props.get("used").and_then(|v| parse_numeric(v)).unwrap_or(0);
            let avail = root
                .props
                .get("available")
                .and_then(|v| parse_numeric(v))
                .unwrap_or(0);
            root.props
                .insert("used".to_string(), used.saturating_sub(size).to_string());
            root.props
                .insert("available".to_string(), avail.saturating_add(size).to_string());
        }
        Ok(())
    }

    fn hold(&self, snapshot: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Hold {
            snapshot: snapshot.to_string(),
            tag: tag.to_string(),
        });
        let command = render_command("zfs", &hold_args(snapshot, tag));
        state.check(&command, snapshot)?;
        let entity = state.find_mut(&command, snapshot)?;
        if !entity.holds.insert(tag.to_string()) {
            return Err(ZscError::StorageCommand {
                command,
                details: "tag already exists on this dataset".to_string(),
            });
        }
        Ok(())
    }

    fn release(&self, snapshot: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Release {
            snapshot: snapshot.to_string(),
            tag: tag.to_string(),
        });
        let command = render_command("zfs", &release_args(snapshot, tag));
        state.check(&command, snapshot)?;
        let entity = state.find_mut(&command, snapshot)?;
        if !entity.holds.remove(tag) {
            return Err(ZscError::StorageCommand {
                command,
                details: "no such tag on this dataset".to_string(),
            });
        }
        Ok(())
    }

    fn list_tags(&self, snapshot: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::ListTags(snapshot.to_string()));
        let command = format!("zfs holds -H {snapshot}");
        state.check(&command, snapshot)?;
        Ok(state.find_mut(&command, snapshot)?.holds.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn created(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn sample() -> MockStorage {
        MockStorage::new("tank", 800, 200)
            .filesystem("tank/home", 100)
            .snapshot("tank/home@a", created(1), 50)
            .snapshot("tank/home@b", created(2), 30)
            .filesystem("tank/homework", 10)
    }

    #[test]
    fn parses_tab_separated_rows() {
        let row = PropertyRow::parse_line("tank/home@a\tcreation\t1760000000")
            .unwrap()
            .unwrap();
        assert_eq!(row.entity, "tank/home@a");
        assert_eq!(row.property, "creation");
        assert_eq!(row.value_u64(), Some(1_760_000_000));
    }

    #[test]
    fn parses_whitespace_rows_and_blank_lines() {
        let row = PropertyRow::parse_line("tank  used  4096").unwrap().unwrap();
        assert_eq!(row.value, "4096");
        assert!(PropertyRow::parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_row_is_a_discovery_error() {
        let err = PropertyRow::parse_line("tank used").unwrap_err();
        assert_eq!(err.code(), "ZSC-2001");
    }

    #[test]
    fn placeholder_values_are_unset() {
        assert_eq!(parse_numeric("-"), None);
        assert_eq!(parse_numeric("none"), None);
        assert_eq!(parse_numeric("12"), Some(12));
    }

    #[test]
    fn holds_output_yields_tag_column() {
        let raw = "tank/home@a\tkeep\tThu Oct  1 00:00 2026\ntank/home@a\tbackup\tThu Oct  1 00:00 2026\n";
        assert_eq!(parse_holds(raw), vec!["keep", "backup"]);
    }

    #[test]
    fn command_rendering() {
        assert_eq!(
            render_command("/sbin/zfs", &destroy_args("tank@x")),
            "/sbin/zfs destroy -d tank@x"
        );
        assert_eq!(
            render_command("zfs", &hold_args("tank@x", "keep")),
            "zfs hold keep tank@x"
        );
    }

    #[test]
    fn mock_recursive_listing_respects_name_boundaries() {
        let mock = sample();
        let rows = mock.get("tank/home", &["type"], true).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(names, ["tank/home", "tank/home@a", "tank/home@b"]);
    }

    #[test]
    fn mock_destroy_moves_space_to_available() {
        let mock = sample();
        mock.destroy("tank/home@a").unwrap();
        assert_eq!(mock.get_u64("tank", "used").unwrap(), Some(750));
        assert_eq!(mock.get_u64("tank", "available").unwrap(), Some(250));
        assert_eq!(mock.snapshot_names(), ["tank/home@b"]);
    }

    #[test]
    fn mock_hold_release_are_strict() {
        let mock = sample();
        mock.hold("tank/home@a", "keep").unwrap();
        assert!(mock.hold("tank/home@a", "keep").is_err());
        assert_eq!(mock.get_u64("tank/home@a", "userrefs").unwrap(), Some(1));
        assert!(mock.destroy("tank/home@a").is_err(), "held snapshot is busy");
        mock.release("tank/home@a", "keep").unwrap();
        assert!(mock.release("tank/home@a", "keep").is_err());
        assert_eq!(mock.mutations().len(), 5);
    }

    #[test]
    fn mock_failure_injection() {
        let mock = sample().failing_on("tank/home@b");
        let err = mock.destroy("tank/home@b").unwrap_err();
        assert_eq!(err.code(), "ZSC-3001");
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_entity_fails_get() {
        let mock = sample();
        assert!(mock.get("tank/nope", &["used"], false).is_err());
    }
}
