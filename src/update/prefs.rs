//! Update preferences persistence.
//!
//! Tracks the auto-update preference, the last check timestamp and the
//! release the user chose to skip. Persisted to `prefs.json` in the data
//! directory.

use crate::error::Result;
use crate::persist::{load_json, save_json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// Persistent update preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePrefs {
    /// Install non-critical updates without asking.
    pub auto_update: bool,
    /// Epoch millis of the last completed check.
    pub last_check: Option<i64>,
    /// Release version the user dismissed.
    pub dismissed_release: Option<String>,
}

impl Default for UpdatePrefs {
    fn default() -> Self {
        Self {
            auto_update: true,
            last_check: None,
            dismissed_release: None,
        }
    }
}

impl UpdatePrefs {
    /// Returns `true` if the last check is older than `max_age_millis`
    /// (or no check has been recorded yet).
    pub fn check_is_stale(&self, max_age_millis: i64, now: i64) -> bool {
        match self.last_check {
            Some(last) => now.saturating_sub(last) >= max_age_millis,
            None => true,
        }
    }
}

/// Shared, optionally persisted [`UpdatePrefs`].
#[derive(Debug)]
pub struct PrefsStore {
    prefs: Mutex<UpdatePrefs>,
    path: Option<PathBuf>,
}

impl PrefsStore {
    /// Memory-only store seeded with `prefs`.
    pub fn new(prefs: UpdatePrefs) -> Self {
        Self {
            prefs: Mutex::new(prefs),
            path: None,
        }
    }

    /// Store persisted to `path`. A missing file yields `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TetherError::Storage`] if the file exists but cannot be parsed.
    pub fn open(path: PathBuf, defaults: UpdatePrefs) -> Result<Self> {
        let prefs = if path.exists() {
            load_json(Some(&path))?
        } else {
            defaults
        };
        Ok(Self {
            prefs: Mutex::new(prefs),
            path: Some(path),
        })
    }

    pub fn get(&self) -> UpdatePrefs {
        self.prefs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `mutate` and persist. The in-memory value only changes once the
    /// write succeeded.
    pub fn update<F>(&self, mutate: F) -> Result<UpdatePrefs>
    where
        F: FnOnce(&mut UpdatePrefs),
    {
        let mut prefs = self.prefs.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = prefs.clone();
        mutate(&mut next);
        save_json(self.path.as_deref(), &next)?;
        *prefs = next.clone();
        Ok(next)
    }
}
