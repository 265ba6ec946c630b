//! Migration history file.
//!
//! A single JSON document mapping migration name to the UTC timestamp it was
//! applied at. The file is advisory only: a read failure is logged and
//! treated as "nothing has been applied yet" rather than a fatal error.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to write migration history to {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("failed to serialize migration history: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationHistory {
    applied: HashMap<String, DateTime<Utc>>,
}

impl MigrationHistory {
    /// Loads the history file. A missing file or a parse failure is logged
    /// and treated as an empty history, so every migration gets reapplied.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                log::warn!("failed to read migration history at {}: {err}", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(history) => history,
            Err(err) => {
                log::warn!("failed to parse migration history at {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| HistoryError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.applied.contains_key(name)
    }

    pub fn mark_applied(&mut self, name: impl Into<String>, at: DateTime<Utc>) {
        self.applied.insert(name.into(), at);
    }

    pub fn applied_names(&self) -> impl Iterator<Item = &str> {
        self.applied.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.history");
        let history = MigrationHistory::load(&path);
        assert!(!history.contains("anything"));
    }

    /// Encoding a history to JSON and decoding it back yields the same
    /// name -> timestamp set.
    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.history");

        let mut history = MigrationHistory::default();
        history.mark_applied("create_transfers_table", Utc::now());
        history.mark_applied("create_searches_table", Utc::now());
        history.save(&path).unwrap();

        let reloaded = MigrationHistory::load(&path);
        assert_eq!(reloaded, history);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.history");
        std::fs::write(&path, "not json at all").unwrap();

        let history = MigrationHistory::load(&path);
        assert!(!history.contains("anything"));
    }
}
