//! The event type carried between instances.

use crate::state::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncEventKind {
    /// A piece of user content changed; `entity_id` says which.
    ContentChanged,
    /// The settings record changed.
    SettingsChanged,
    /// A newer package was found.
    UpdateAvailable,
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ContentChanged => "content-changed",
            Self::SettingsChanged => "settings-changed",
            Self::UpdateAvailable => "update-available",
        };
        f.write_str(s)
    }
}

/// A lightweight, non-persisted notification broadcast between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    pub entity_id: Option<String>,
    /// Epoch millis at creation.
    pub timestamp: i64,
    /// Stamped by the publishing bus.
    pub source_instance_id: String,
    /// Optional state delta (e.g. the winning settings record).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind) -> Self {
        Self {
            kind,
            entity_id: None,
            timestamp: now_millis(),
            source_instance_id: String::new(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
