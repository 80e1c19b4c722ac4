//! Tick outcomes and run history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// No newer release (or a check was already running).
    NothingPending,
    /// The release feed could not be reached.
    CheckFailed,
    /// A package is pending but the user turned auto-update off.
    AutoUpdateDisabled,
    /// A critical package was downloaded and waits for explicit confirmation.
    AwaitingConfirmation,
    Installed,
    /// Verification or install failed and the snapshot was restored.
    RolledBack,
    /// Apply could not start (e.g. the snapshot could not be captured).
    ApplyFailed,
    DownloadFailed,
}

impl TickOutcome {
    /// Whether the tick ended in a failure that was logged and swallowed.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::CheckFailed | Self::RolledBack | Self::ApplyFailed | Self::DownloadFailed
        )
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NothingPending => "nothing_pending",
            Self::CheckFailed => "check_failed",
            Self::AutoUpdateDisabled => "auto_update_disabled",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Installed => "installed",
            Self::RolledBack => "rolled_back",
            Self::ApplyFailed => "apply_failed",
            Self::DownloadFailed => "download_failed",
        };
        f.write_str(s)
    }
}

/// One entry of the scheduler's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Epoch millis.
    pub started_at: i64,
    /// Epoch millis.
    pub finished_at: i64,
    pub outcome: TickOutcome,
    /// Version of the package the tick acted on, if any.
    pub version: Option<String>,
    pub summary: String,
}

/// Bounded run history, oldest first.
#[derive(Debug, Clone)]
pub(crate) struct TickHistory {
    records: Vec<TickRecord>,
    max_entries: usize,
}

impl TickHistory {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            records: Vec::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub(crate) fn push(&mut self, record: TickRecord) {
        self.records.push(record);
        if self.records.len() > self.max_entries {
            let drop_count = self.records.len() - self.max_entries;
            self.records.drain(0..drop_count);
        }
    }

    pub(crate) fn records(&self) -> &[TickRecord] {
        &self.records
    }
}
