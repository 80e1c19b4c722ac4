//! Append-only record of install attempts.

use crate::error::Result;
use crate::persist::{load_json, save_json};
use crate::state::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Outcome of one install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Success,
    /// Download failed before anything local changed.
    Failed,
    /// Verification or install failed and the snapshot was restored.
    Rollback,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub id: String,
    pub device_id: String,
    pub version_from: String,
    pub version_to: String,
    pub status: UpdateStatus,
    /// Epoch millis.
    pub timestamp: i64,
    pub details: String,
}

impl UpdateLogEntry {
    pub fn new(
        device_id: &str,
        version_from: &str,
        version_to: &str,
        status: UpdateStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_owned(),
            version_from: version_from.to_owned(),
            version_to: version_to.to_owned(),
            status,
            timestamp: now_millis(),
            details: details.into(),
        }
    }
}

/// Bounded update log. Entries are never edited; once `max_entries` is
/// reached the oldest are dropped.
#[derive(Debug)]
pub struct UpdateLog {
    entries: Mutex<Vec<UpdateLogEntry>>,
    max_entries: usize,
    path: Option<PathBuf>,
}

impl UpdateLog {
    /// Memory-only log.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries: max_entries.max(1),
            path: None,
        }
    }

    /// Log persisted to `path`, loading existing entries.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TetherError::Storage`] if the file exists but cannot be parsed.
    pub fn open(path: PathBuf, max_entries: usize) -> Result<Self> {
        let entries: Vec<UpdateLogEntry> = load_json(Some(&path))?;
        Ok(Self {
            entries: Mutex::new(entries),
            max_entries: max_entries.max(1),
            path: Some(path),
        })
    }

    /// Append `entry`. Nothing is appended if the log cannot be persisted.
    pub fn append(&self, entry: UpdateLogEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = entries.clone();
        debug!(status = %entry.status, to = %entry.version_to, "update log append");
        next.push(entry);
        if next.len() > self.max_entries {
            let excess = next.len() - self.max_entries;
            next.drain(..excess);
        }
        save_json(self.path.as_deref(), &next)?;
        *entries = next;
        Ok(())
    }

    /// All entries, newest first.
    pub fn entries(&self) -> Vec<UpdateLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().cloned().collect()
    }

    pub fn count(&self, status: UpdateStatus) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
