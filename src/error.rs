//! Error types for the update and sync subsystem.

/// Top-level error type for tether.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Release lookup or package download failed before any local mutation.
    #[error("transport error: {0}")]
    Transport(String),

    /// Downloaded payload did not match the package's integrity digest.
    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity {
        /// Digest advertised by the package.
        expected: String,
        /// Digest computed from the downloaded bytes (or a reason it could not be).
        actual: String,
    },

    /// Installation failed after verification passed.
    #[error("install error: {0}")]
    Install(String),

    /// A snapshot id was not found. Indicates a bookkeeping bug.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persisted state could not be read, parsed or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl TetherError {
    /// Returns `true` for failures that happen after a snapshot was captured
    /// and therefore restore it.
    pub fn triggers_rollback(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::Install(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TetherError>;
