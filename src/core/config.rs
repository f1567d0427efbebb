//! Configuration: TOML file + env var overrides, validated before any run.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, ZscError};
use crate::model::hierarchy::{DEFAULT_MAX_CAPACITY, DatasetPolicy, PoolSettings};
use crate::policy::rules::{MaxFileAge, RuleSet};
use crate::reaper::eviction::TieBreak;

/// Default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/zfs-snapshots-cleaner.toml";

/// Full configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub zfs: ZfsConfig,
    pub logging: LoggingConfig,
    pub pools: Vec<PoolConfig>,
    /// Where this configuration was read from (not part of the file).
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Storage command backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ZfsConfig {
    pub binary: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            binary: "/sbin/zfs".to_string(),
        }
    }
}

/// JSONL activity log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Disabled when unset.
    pub activity_log: Option<PathBuf>,
    pub max_log_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            activity_log: None,
            max_log_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default = "default_max_capacity", alias = "maxCapacity")]
    pub max_capacity: f64,
    #[serde(default = "default_tie_break", alias = "bestEffortPolicy")]
    pub best_effort_policy: String,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

/// Per-dataset settings. Every field left out inherits from the nearest
/// configured ancestor dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default, alias = "retentionPolicy")]
    pub retention_policy: Option<String>,
    #[serde(default, alias = "maxRetention")]
    pub max_retention: Option<String>,
    #[serde(default, alias = "maxFileAge")]
    pub max_file_age: Option<String>,
    #[serde(default, alias = "maxCapacity")]
    pub max_capacity: Option<f64>,
    #[serde(default, alias = "mountPoint")]
    pub mount_point: Option<PathBuf>,
}

const fn default_max_capacity() -> f64 {
    DEFAULT_MAX_CAPACITY
}

fn default_tie_break() -> String {
    TieBreak::default().to_string()
}

impl PoolConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_capacity: DEFAULT_MAX_CAPACITY,
            best_effort_policy: default_tie_break(),
            datasets: Vec::new(),
        }
    }

    pub fn tie_break(&self) -> Result<TieBreak> {
        self.best_effort_policy.parse()
    }

    pub fn settings(&self) -> Result<PoolSettings> {
        Ok(PoolSettings {
            max_capacity: self.max_capacity,
            tie_break: self.tie_break()?,
        })
    }
}

impl DatasetConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse the configured strings into a dataset policy.
    pub fn to_policy(&self) -> Result<DatasetPolicy> {
        Ok(DatasetPolicy {
            retention_policy: self.retention_policy.as_deref().map(RuleSet::parse).transpose()?,
            max_retention: self.max_retention.as_deref().map(RuleSet::parse).transpose()?,
            max_file_age: self
                .max_file_age
                .as_deref()
                .map(str::parse::<MaxFileAge>)
                .transpose()?,
            max_capacity: self.max_capacity,
            mount_point: self.mount_point.clone(),
        })
    }
}

impl Config {
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// A missing file at the default path yields defaults (no pools).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| ZscError::io(&path_buf, source))?;
            Self::from_toml(&raw)?
        } else if path.is_some() {
            return Err(ZscError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.source = Some(path_buf);
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse without env overrides or validation.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Deterministic hash of the effective config (FNV-1a over canonical JSON).
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ZSC_ZFS_BINARY") {
            self.zfs.binary = raw;
        }
        if let Some(raw) = lookup("ZSC_ACTIVITY_LOG") {
            self.logging.activity_log = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("ZSC_MAX_LOG_BYTES") {
            self.logging.max_log_bytes = parse_env_u64("ZSC_MAX_LOG_BYTES", &raw)?;
        }
        Ok(())
    }

    /// Reject anything that would make a run's decisions unsound.
    pub fn validate(&self) -> Result<()> {
        if self.zfs.binary.trim().is_empty() {
            return Err(invalid("zfs.binary must not be empty".to_string()));
        }
        if self.logging.max_log_bytes == 0 {
            return Err(invalid("logging.max_log_bytes must be > 0".to_string()));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                return Err(invalid("pool name must not be empty".to_string()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(invalid(format!("pool {} is configured twice", pool.name)));
            }
            validate_fraction(&format!("pools.{}.max_capacity", pool.name), pool.max_capacity)?;
            pool.tie_break()?;

            for dataset in &pool.datasets {
                if dataset.name.trim().is_empty() {
                    return Err(invalid(format!("pool {} has a dataset without a name", pool.name)));
                }
                if let Some(fraction) = dataset.max_capacity {
                    validate_fraction(&format!("datasets.{}.max_capacity", dataset.name), fraction)?;
                }
                dataset.to_policy()?;
            }
        }
        Ok(())
    }
}

fn invalid(details: String) -> ZscError {
    ZscError::InvalidConfig { details }
}

fn validate_fraction(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(invalid(format!("{name} must be in (0,1], got {value}")));
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| ZscError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[zfs]
binary = "/usr/sbin/zfs"

[logging]
activity_log = "/var/log/zsc/activity.jsonl"

[[pools]]
name = "tank"
max_capacity = 0.9
best_effort_policy = "oldest"

[[pools.datasets]]
name = "tank/home"
retention_policy = "24 hours and 7 days and 4 sundays"
max_retention = "3 1st day of the month"
max_file_age = "2 weeks"

[[pools.datasets]]
name = "tank/home/scratch"
maxCapacity = 0.5
mount_point = "/scratch"
"#;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.pools.is_empty());
        assert_eq!(cfg.zfs.binary, "/sbin/zfs");
    }

    #[test]
    fn parses_full_sample() {
        let cfg = Config::from_toml(SAMPLE).unwrap();
        cfg.validate().unwrap();
        let pool = cfg.pool("tank").unwrap();
        assert_eq!(pool.tie_break().unwrap(), TieBreak::Oldest);
        assert_eq!(pool.datasets.len(), 2);

        let home = pool.datasets[0].to_policy().unwrap();
        assert_eq!(home.retention_policy.unwrap().len(), 3);
        assert_eq!(home.max_file_age.unwrap().days(), 14);

        let scratch = pool.datasets[1].to_policy().unwrap();
        assert!(scratch.retention_policy.is_none());
        assert_eq!(scratch.max_capacity, Some(0.5));
        assert_eq!(scratch.mount_point, Some(PathBuf::from("/scratch")));
    }

    #[test]
    fn pool_defaults_apply() {
        let cfg = Config::from_toml("[[pools]]\nname = \"tank\"\n").unwrap();
        let pool = &cfg.pools[0];
        assert!((pool.max_capacity - 0.8).abs() < f64::EPSILON);
        assert_eq!(pool.tie_break().unwrap(), TieBreak::MoreRemovable);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = Config::from_toml("[[pools]]\nname = \"tank\"\ncolour = 1\n").unwrap_err();
        assert_eq!(err.code(), "ZSC-1003");
    }

    #[test]
    fn bad_clause_fails_validation() {
        let mut cfg = Config::default();
        let mut pool = PoolConfig::new("tank");
        let mut ds = DatasetConfig::new("tank/a");
        ds.retention_policy = Some("3 fortnights".to_string());
        pool.datasets.push(ds);
        cfg.pools.push(pool);
        assert_eq!(cfg.validate().unwrap_err().code(), "ZSC-1101");
    }

    #[test]
    fn bad_tie_break_and_fraction_rejected() {
        let mut cfg = Config::default();
        let mut pool = PoolConfig::new("tank");
        pool.best_effort_policy = "random".to_string();
        cfg.pools.push(pool);
        assert_eq!(cfg.validate().unwrap_err().code(), "ZSC-1102");

        cfg.pools[0].best_effort_policy = "biggest".to_string();
        cfg.pools[0].max_capacity = 0.0;
        assert_eq!(cfg.validate().unwrap_err().code(), "ZSC-1001");

        cfg.pools[0].max_capacity = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_pool_rejected() {
        let mut cfg = Config::default();
        cfg.pools.push(PoolConfig::new("tank"));
        cfg.pools.push(PoolConfig::new("tank"));
        match cfg.validate().unwrap_err() {
            ZscError::InvalidConfig { details } => assert!(details.contains("twice")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_string_policy_is_explicit_empty_set() {
        let mut ds = DatasetConfig::new("tank/a");
        ds.max_retention = Some(String::new());
        let policy = ds.to_policy().unwrap();
        assert_eq!(policy.max_retention, Some(RuleSet::default()));
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("ZSC_ZFS_BINARY", "/opt/zfs"),
            ("ZSC_ACTIVITY_LOG", "/tmp/a.jsonl"),
            ("ZSC_MAX_LOG_BYTES", "4096"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap();
        assert_eq!(cfg.zfs.binary, "/opt/zfs");
        assert_eq!(cfg.logging.activity_log, Some(PathBuf::from("/tmp/a.jsonl")));
        assert_eq!(cfg.logging.max_log_bytes, 4096);
    }

    #[test]
    fn env_parse_failure_is_config_parse() {
        let env = vars(&[("ZSC_MAX_LOG_BYTES", "lots")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap_err();
        assert!(matches!(err, ZscError::ConfigParse { context: "env", .. }));
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let mut modified = Config::default();
        modified.pools.push(PoolConfig::new("tank"));
        assert_eq!(cfg.stable_hash().unwrap(), Config::default().stable_hash().unwrap());
        assert_ne!(cfg.stable_hash().unwrap(), modified.stable_hash().unwrap());
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/zsc/config.toml"))).unwrap_err();
        assert!(matches!(err, ZscError::MissingConfig { .. }));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zsc.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.source.as_deref(), Some(path.as_path()));
        assert_eq!(cfg.pools.len(), 1);
    }
}
