//! ZSC-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, ZscError>;

/// Top-level error type for the snapshot cleaner.
#[derive(Debug, Error)]
pub enum ZscError {
    #[error("[ZSC-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[ZSC-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[ZSC-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[ZSC-1101] unknown retention clause: {clause:?}")]
    UnknownClause { clause: String },

    #[error("[ZSC-1102] unknown best-effort policy: {name:?}")]
    UnknownTieBreak { name: String },

    #[error("[ZSC-1103] unknown file age expression: {expr:?}")]
    UnknownFileAge { expr: String },

    #[error("[ZSC-2001] malformed property listing: {details}")]
    Discovery { details: String },

    #[error("[ZSC-2002] snapshot {name} has no parent dataset in the listing")]
    OrphanSnapshot { name: String },

    #[error("[ZSC-2003] snapshot {name} was already destroyed in this run")]
    SnapshotDestroyed { name: String },

    #[error("[ZSC-2004] unknown entity {name}")]
    UnknownEntity { name: String },

    #[error("[ZSC-3001] storage command failed: {command}: {details}")]
    StorageCommand { command: String, details: String },

    #[error("[ZSC-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[ZSC-3101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },
}

impl ZscError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "ZSC-1001",
            Self::MissingConfig { .. } => "ZSC-1002",
            Self::ConfigParse { .. } => "ZSC-1003",
            Self::UnknownClause { .. } => "ZSC-1101",
            Self::UnknownTieBreak { .. } => "ZSC-1102",
            Self::UnknownFileAge { .. } => "ZSC-1103",
            Self::Discovery { .. } => "ZSC-2001",
            Self::OrphanSnapshot { .. } => "ZSC-2002",
            Self::SnapshotDestroyed { .. } => "ZSC-2003",
            Self::UnknownEntity { .. } => "ZSC-2004",
            Self::StorageCommand { .. } => "ZSC-3001",
            Self::Io { .. } => "ZSC-3002",
            Self::Serialization { .. } => "ZSC-3101",
        }
    }

    /// Whether a later run might succeed without a configuration change.
    ///
    /// Nothing is retried inside a run; this only informs the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageCommand { .. } | Self::Io { .. })
    }

    /// Whether the error stems from the configuration file.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
                | Self::ConfigParse { .. }
                | Self::UnknownClause { .. }
                | Self::UnknownTieBreak { .. }
                | Self::UnknownFileAge { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for ZscError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for ZscError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
