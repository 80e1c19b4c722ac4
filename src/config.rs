//! Configuration for the update and sync subsystem.
//!
//! Loaded from `~/.config/tether/config.toml`. Every section falls back to
//! its defaults for missing fields.

use crate::error::{Result, TetherError};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Which user this instance runs for and where its state lives.
    pub instance: InstanceConfig,
    /// Update pipeline settings.
    pub updates: UpdatesConfig,
    /// Background scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Bounds for snapshots and the update log.
    pub retention: RetentionConfig,
    /// Cross-instance event bus settings.
    pub sync: SyncConfig,
}

/// Instance identity and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// User the settings record belongs to.
    pub user_id: String,
    /// Directory for persisted state. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            user_id: "guest".to_owned(),
            data_dir: None,
        }
    }
}

/// Update pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// Version assumed installed when no version pointer has been persisted.
    pub baseline_version: String,
    /// Initial auto-update preference (persisted preference wins once set).
    pub auto_update: bool,
    /// Override for the detected target platform (e.g. `"linux"`).
    pub platform: Option<String>,
    /// Release manifest for the file-backed feed.
    pub manifest_path: Option<PathBuf>,
    /// Directory receiving installed artifacts. `None` installs nothing on disk.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            baseline_version: "11.0.0".to_owned(),
            auto_update: true,
            platform: None,
            manifest_path: None,
            artifact_dir: None,
        }
    }
}

/// Background scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between update checks.
    pub interval_secs: u64,
    /// Whether the scheduler loop is started at all.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 3600,
            enabled: true,
        }
    }
}

/// Growth bounds for recovery points and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Snapshots kept at most; the oldest are evicted first.
    pub max_snapshots: usize,
    /// Age after which snapshots are discarded following a successful commit.
    pub snapshot_retention_secs: u64,
    /// Update log entries kept at most.
    pub max_log_entries: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 5,
            snapshot_retention_secs: 7 * 24 * 3600,
            max_log_entries: 200,
        }
    }
}

/// Cross-instance event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-instance buffer of undelivered events before the oldest are dropped.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl TetherConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| TetherError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TetherError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            return Err(TetherError::Config(
                "scheduler.interval_secs must be greater than zero".to_owned(),
            ));
        }
        if self.sync.channel_capacity == 0 {
            return Err(TetherError::Config(
                "sync.channel_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.retention.max_snapshots == 0 {
            return Err(TetherError::Config(
                "retention.max_snapshots must be greater than zero".to_owned(),
            ));
        }
        if self.updates.baseline_version.parse::<Version>().is_err() {
            return Err(TetherError::Config(format!(
                "updates.baseline_version {:?} is not a valid version",
                self.updates.baseline_version
            )));
        }
        Ok(())
    }

    /// Returns the default config file path: `~/.config/tether/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("tether").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("tether")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/tether-config/config.toml")
        }
    }
}
