//! Recovery points taken before every install attempt.
//!
//! A [`Snapshot`] holds a copy of the settings record and the version pointer
//! as of one instant. Snapshots are never mutated. The list is bounded: once
//! `max_snapshots` is exceeded the oldest are evicted, and
//! [`SnapshotStore::discard_older_than`] prunes by age after a successful commit.

use crate::error::{Result, TetherError};
use crate::persist::{load_json, save_json};
use crate::state::{SettingsRecord, StateStore, now_millis};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Identifier of a captured snapshot.
pub type SnapshotId = String;

/// An immutable recovery point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Epoch millis at capture.
    pub timestamp: i64,
    pub settings_copy: SettingsRecord,
    pub version_at_capture: String,
}

/// Owns snapshot records and restores them into the shared [`StateStore`].
pub struct SnapshotStore {
    state: StateStore,
    snapshots: Mutex<Vec<Snapshot>>,
    max_snapshots: usize,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Memory-only store.
    pub fn new(state: StateStore, max_snapshots: usize) -> Self {
        Self {
            state,
            snapshots: Mutex::new(Vec::new()),
            max_snapshots: max_snapshots.max(1),
            path: None,
        }
    }

    /// Store persisted to `path`, loading any snapshots already there.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the existing file cannot be parsed.
    pub fn open(state: StateStore, max_snapshots: usize, path: PathBuf) -> Result<Self> {
        let snapshots: Vec<Snapshot> = load_json(Some(&path))?;
        let store = Self {
            state,
            snapshots: Mutex::new(snapshots),
            max_snapshots: max_snapshots.max(1),
            path: Some(path),
        };
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Snapshot>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture the current settings and version pointer as a new snapshot.
    ///
    /// The new list is persisted before it becomes visible, so a failed write
    /// leaves no partial snapshot behind.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the snapshot list cannot be written.
    pub fn capture(&self) -> Result<SnapshotId> {
        let (version, settings) = self.state.read_consistent();
        let snapshot = Snapshot {
            id: format!("snapshot_{}", uuid::Uuid::new_v4()),
            timestamp: now_millis(),
            settings_copy: settings,
            version_at_capture: version,
        };
        let id = snapshot.id.clone();

        let mut snapshots = self.lock();
        let mut next = snapshots.clone();
        next.push(snapshot);
        if next.len() > self.max_snapshots {
            let drop_count = next.len() - self.max_snapshots;
            next.drain(0..drop_count);
        }
        save_json(self.path.as_deref(), &next)?;
        *snapshots = next;

        info!(snapshot = %id, "captured system snapshot");
        Ok(id)
    }

    /// Overwrite the settings record and version pointer with the snapshot's values.
    ///
    /// # Errors
    ///
    /// [`TetherError::SnapshotNotFound`] if `id` is unknown. This means the
    /// caller's bookkeeping is broken and is logged at `error`.
    pub fn restore(&self, id: &str) -> Result<()> {
        let snapshot = match self.get(id) {
            Some(s) => s,
            None => {
                error!(snapshot = %id, "restore requested for unknown snapshot");
                return Err(TetherError::SnapshotNotFound(id.to_owned()));
            }
        };

        self.state
            .restore(&snapshot.version_at_capture, &snapshot.settings_copy)?;
        info!(
            snapshot = %id,
            version = %snapshot.version_at_capture,
            "restored system snapshot"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Snapshot> {
        self.lock().iter().find(|s| s.id == id).cloned()
    }

    /// All retained snapshots, oldest first.
    pub fn list(&self) -> Vec<Snapshot> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop snapshots captured more than `max_age_millis` before `now`.
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Storage`] if the pruned list cannot be written.
    pub fn discard_older_than(&self, max_age_millis: i64, now: i64) -> Result<usize> {
        let cutoff = now.saturating_sub(max_age_millis);
        let mut snapshots = self.lock();
        let next: Vec<Snapshot> = snapshots
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect();
        let removed = snapshots.len() - next.len();
        if removed > 0 {
            save_json(self.path.as_deref(), &next)?;
            *snapshots = next;
            debug!(removed, "discarded expired snapshots");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn store(max: usize) -> (StateStore, SnapshotStore) {
        let state = StateStore::in_memory("alice", "11.0.0");
        let snapshots = SnapshotStore::new(state.clone(), max);
        (state, snapshots)
    }

    #[test]
    fn capture_copies_version_and_settings() {
        let (state, snapshots) = store(5);
        state
            .update_settings(|s| s.theme = "light".to_owned())
            .unwrap();

        let id = snapshots.capture().unwrap();
        let snap = snapshots.get(&id).unwrap();
        assert_eq!(snap.version_at_capture, "11.0.0");
        assert_eq!(snap.settings_copy.theme, "light");
    }

    #[test]
    fn restore_rewinds_state() {
        let (state, snapshots) = store(5);
        let before = state.read_consistent();
        let id = snapshots.capture().unwrap();

        state.set_version("11.1.0").unwrap();
        state
            .update_settings(|s| s.notifications_enabled = false)
            .unwrap();

        snapshots.restore(&id).unwrap();
        assert_eq!(state.read_consistent(), before);
    }

    #[test]
    fn snapshot_can_be_restored_repeatedly() {
        let (state, snapshots) = store(5);
        let id = snapshots.capture().unwrap();
        for attempt in 0..3 {
            state.set_version(&format!("12.0.{attempt}")).unwrap();
            snapshots.restore(&id).unwrap();
            assert_eq!(state.current_version(), "11.0.0");
        }
    }

    #[test]
    fn unknown_snapshot_is_reported() {
        let (_state, snapshots) = store(5);
        assert!(matches!(
            snapshots.restore("snapshot_missing"),
            Err(TetherError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn growth_is_bounded() {
        let (_state, snapshots) = store(2);
        let first = snapshots.capture().unwrap();
        snapshots.capture().unwrap();
        let last = snapshots.capture().unwrap();

        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.get(&first).is_none());
        assert!(snapshots.get(&last).is_some());
    }

    #[test]
    fn discard_older_than_prunes_by_age() {
        let (_state, snapshots) = store(5);
        let id = snapshots.capture().unwrap();
        let captured_at = snapshots.get(&id).unwrap().timestamp;

        assert_eq!(snapshots.discard_older_than(1_000, captured_at + 10).unwrap(), 0);
        assert_eq!(snapshots.discard_older_than(1_000, captured_at + 5_000).unwrap(), 1);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn persisted_snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.json");
        let state = StateStore::in_memory("alice", "11.0.0");

        let id = {
            let snapshots = SnapshotStore::open(state.clone(), 5, path.clone()).unwrap();
            snapshots.capture().unwrap()
        };

        let reopened = SnapshotStore::open(state.clone(), 5, path).unwrap();
        state.set_version("13.0.0").unwrap();
        reopened.restore(&id).unwrap();
        assert_eq!(state.current_version(), "11.0.0");
    }
}
