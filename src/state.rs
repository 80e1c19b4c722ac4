//! Mutable local state: the installed-version pointer and the settings record.
//!
//! Both live behind a single lock so a reader always sees a pair that was
//! consistent at one instant. That is what makes snapshot capture and restore
//! atomic. Persisted to `<data_dir>/state.json` when a data directory is set.

use crate::error::Result;
use crate::persist::{load_json, save_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Strength of translucent/glass effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeIntensity {
    Low,
    #[default]
    Medium,
    High,
}

/// Spacing density of the interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiDensity {
    Compact,
    #[default]
    Comfortable,
}

/// Per-user settings record. Opaque to the snapshot store, which copies it whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsRecord {
    pub user_id: String,
    pub theme: String,
    pub notifications_enabled: bool,
    pub language: String,
    pub theme_intensity: ThemeIntensity,
    pub ui_density: UiDensity,
    /// Epoch millis of the last local or merged write.
    pub updated_at: i64,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self::for_user("guest")
    }
}

impl SettingsRecord {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            theme: "dark".to_owned(),
            notifications_enabled: true,
            language: "en".to_owned(),
            theme_intensity: ThemeIntensity::default(),
            ui_density: UiDensity::default(),
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateDocument {
    /// Installed-version pointer. `None` until the first commit or restore.
    version: Option<String>,
    /// Settings records keyed by user id.
    settings: BTreeMap<String, SettingsRecord>,
}

struct Inner {
    doc: StateDocument,
    user_id: String,
    baseline_version: String,
    path: Option<PathBuf>,
}

impl Inner {
    fn version(&self) -> String {
        self.doc
            .version
            .clone()
            .unwrap_or_else(|| self.baseline_version.clone())
    }

    fn settings(&self) -> SettingsRecord {
        self.doc
            .settings
            .get(&self.user_id)
            .cloned()
            .unwrap_or_else(|| SettingsRecord::for_user(&self.user_id))
    }

    /// Persist `next` and only then make it the live document.
    fn commit(&mut self, next: StateDocument) -> Result<()> {
        save_json(self.path.as_deref(), &next)?;
        self.doc = next;
        Ok(())
    }
}

/// Shared handle to the version pointer and settings record of one user.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

impl StateStore {
    /// Memory-only store starting at `baseline_version`.
    pub fn in_memory(user_id: &str, baseline_version: &str) -> Self {
        Self::from_parts(StateDocument::default(), user_id, baseline_version, None)
    }

    /// Open (or create) a persisted store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TetherError::Storage`] if an existing file cannot be parsed.
    pub fn open(path: PathBuf, user_id: &str, baseline_version: &str) -> Result<Self> {
        let doc: StateDocument = load_json(Some(&path))?;
        Ok(Self::from_parts(doc, user_id, baseline_version, Some(path)))
    }

    fn from_parts(
        doc: StateDocument,
        user_id: &str,
        baseline_version: &str,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                doc,
                user_id: user_id.to_owned(),
                baseline_version: baseline_version.to_owned(),
                path,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn user_id(&self) -> String {
        self.lock().user_id.clone()
    }

    /// Currently installed version.
    pub fn current_version(&self) -> String {
        self.lock().version()
    }

    /// Current user's settings record.
    pub fn settings(&self) -> SettingsRecord {
        self.lock().settings()
    }

    /// Version pointer and settings read under one lock.
    pub fn read_consistent(&self) -> (String, SettingsRecord) {
        let inner = self.lock();
        (inner.version(), inner.settings())
    }

    /// Move the version pointer. Only the updater calls this.
    pub(crate) fn set_version(&self, version: &str) -> Result<()> {
        let mut inner = self.lock();
        let mut next = inner.doc.clone();
        next.version = Some(version.to_owned());
        inner.commit(next)
    }

    /// Mutate the current user's settings and stamp `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state cannot be persisted; the live record
    /// is left unchanged in that case.
    pub fn update_settings<F>(&self, mutate: F) -> Result<SettingsRecord>
    where
        F: FnOnce(&mut SettingsRecord),
    {
        self.update_settings_after(i64::MIN, mutate)
    }

    /// Like [`StateStore::update_settings`], but `updated_at` is stamped no
    /// earlier than `not_before`.
    ///
    /// The stamp is also strictly later than the previous record's, so a
    /// local write always supersedes what it was derived from.
    pub fn update_settings_after<F>(&self, not_before: i64, mutate: F) -> Result<SettingsRecord>
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let mut inner = self.lock();
        let mut record = inner.settings();
        let previous = record.updated_at;
        mutate(&mut record);
        record.user_id = inner.user_id.clone();
        record.updated_at = now_millis()
            .max(previous.saturating_add(1))
            .max(not_before);

        let mut next = inner.doc.clone();
        next.settings.insert(inner.user_id.clone(), record.clone());
        inner.commit(next)?;
        Ok(record)
    }

    /// Replace the current user's settings verbatim (used for merged remote writes).
    pub fn replace_settings(&self, record: SettingsRecord) -> Result<()> {
        let mut inner = self.lock();
        let mut next = inner.doc.clone();
        next.settings.insert(inner.user_id.clone(), record);
        inner.commit(next)
    }

    /// Overwrite version pointer and settings together.
    pub(crate) fn restore(&self, version: &str, settings: &SettingsRecord) -> Result<()> {
        let mut inner = self.lock();
        let mut next = inner.doc.clone();
        next.version = Some(version.to_owned());
        next.settings.insert(inner.user_id.clone(), settings.clone());
        inner.commit(next)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("StateStore")
            .field("user_id", &inner.user_id)
            .field("version", &inner.version())
            .field("persisted", &inner.path.is_some())
            .finish()
    }
}
