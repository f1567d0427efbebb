//! Durable audit trail of the actions a run issued or previewed.

pub mod jsonl;

use std::path::PathBuf;

use self::jsonl::{JsonlConfig, JsonlWriter, LogEntry};

/// Activity log handle: a JSONL writer, or nothing when no path is configured.
#[derive(Default)]
pub struct ActivityLog {
    writer: Option<JsonlWriter>,
}

impl ActivityLog {
    /// A log that drops every entry.
    #[must_use]
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Open a JSONL log at `path`, rotating past `max_bytes`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        let mut config = JsonlConfig::new(path);
        config.max_size_bytes = max_bytes;
        Self {
            writer: Some(JsonlWriter::open(config)),
        }
    }

    /// Build from an optional configured path.
    #[must_use]
    pub fn from_path(path: Option<PathBuf>, max_bytes: u64) -> Self {
        path.map_or_else(Self::disabled, |p| Self::open(p, max_bytes))
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&mut self, entry: &LogEntry) {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_entry(entry);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush();
        }
    }
}
