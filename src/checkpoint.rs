//! Durable per-table checkpoints.
//!
//! The checkpoint document is a single JSON object mapping table name to the
//! ISO-8601 timestamp captured on the source just before that table's last
//! successful extraction:
//!
//! ```json
//! {
//!   "orders": "2024-05-01T10:00:00.000Z"
//! }
//! ```
//!
//! A table without an entry is always fully extracted. Loading never fails:
//! a missing, empty, or unreadable document is treated as "no history".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// In-memory checkpoint state for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncState {
    checkpoints: BTreeMap<String, String>,
}

impl SyncState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint recorded for a table.
    pub fn get(&self, table: &str) -> Option<&str> {
        self.checkpoints.get(table).map(String::as_str)
    }

    /// Record a checkpoint for a table.
    pub fn set(&mut self, table: impl Into<String>, checkpoint: impl Into<String>) {
        self.checkpoints.insert(table.into(), checkpoint.into());
    }

    /// Forget a table's checkpoint, forcing its next pass to be a full sync.
    pub fn remove(&mut self, table: &str) -> Option<String> {
        self.checkpoints.remove(table)
    }

    /// Iterate over `(table, checkpoint)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.checkpoints
            .iter()
            .map(|(t, c)| (t.as_str(), c.as_str()))
    }

    /// Number of tables with a checkpoint.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether no table has a checkpoint.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SyncState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            checkpoints: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// File-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Create a store for the document at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the checkpoint document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint document.
    ///
    /// Falls back to an empty state when the file is absent, blank, or not a
    /// JSON object of strings. Blank and invalid documents are replaced with
    /// `{}` on a best-effort basis.
    pub fn load(&self) -> SyncState {
        self.read(true)
    }

    /// Load the checkpoint document without ever writing to it.
    pub fn load_readonly(&self) -> SyncState {
        self.read(false)
    }

    fn read(&self, repair: bool) -> SyncState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No checkpoint document, starting fresh");
                return SyncState::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), "Failed to read checkpoint document: {}", e);
                if repair {
                    self.reset_document();
                }
                return SyncState::new();
            }
        };

        if content.trim().is_empty() {
            info!(path = %self.path.display(), "Checkpoint document is empty, initializing");
            if repair {
                self.reset_document();
            }
            return SyncState::new();
        }

        match serde_json::from_str::<SyncState>(&content) {
            Ok(state) => {
                debug!(tables = state.len(), "Loaded checkpoints");
                state
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    "Checkpoint document is invalid, ignoring it for this run: {}", e
                );
                if repair {
                    self.reset_document();
                }
                SyncState::new()
            }
        }
    }

    /// Persist the state, replacing the document atomically.
    pub fn save(&self, state: &SyncState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        self.write(&contents)?;
        info!(path = %self.path.display(), tables = state.len(), "Checkpoints saved");
        Ok(())
    }

    fn reset_document(&self) {
        match self.write("{}") {
            Ok(()) => info!(path = %self.path.display(), "Created new checkpoint document"),
            Err(e) => warn!("Could not create checkpoint document: {}", e),
        }
    }

    // Write to a sibling temp file, then rename over the target.
    fn write(&self, contents: &str) -> Result<()> {
        let display = self.path.display().to_string();
        let temp_path = self.path.with_extension("tmp");

        std::fs::write(&temp_path, contents)
            .map_err(|e| Error::checkpoint(&display, "Failed to write temp file", e))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::checkpoint(&display, "Failed to replace checkpoint document", e))?;
        Ok(())
    }
}
