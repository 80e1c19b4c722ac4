//! Tether: autonomous update distribution and cross-instance sync.
//!
//! Every running instance of the application for one user carries the same
//! subsystem:
//!
//! - **Snapshot store**: recovery points of the version pointer and the
//!   settings record, restored when an install fails.
//! - **Event bus**: best-effort broadcast of `content-changed`,
//!   `settings-changed` and `update-available` events between live instances.
//! - **Notification router**: in-app and OS push delivery of user-facing
//!   messages.
//! - **Updater**: check, download, verify, install and commit, with rollback
//!   on any failure after the snapshot was taken.
//! - **Scheduler**: a periodic background task driving the updater according
//!   to package severity and the user's auto-update preference.
//!
//! [`Instance`] wires all of them together for one user.

pub mod config;
pub mod error;
pub mod instance;
pub mod integrity;
pub mod notify;
pub(crate) mod persist;
pub mod progress;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod sync;
pub mod update;
pub mod version;

pub use config::TetherConfig;
pub use error::{Result, TetherError};
pub use instance::{Instance, InstanceBuilder};
pub use notify::{Channel, NotificationKind, NotificationRequest, NotificationRouter};
pub use progress::{DownloadProgress, ProgressCallback};
pub use scheduler::{AutoUpdateScheduler, SchedulerHandle, TickOutcome};
pub use snapshot::{Snapshot, SnapshotId, SnapshotStore};
pub use state::{SettingsRecord, StateStore};
pub use sync::{EventBus, SyncEvent, SyncEventKind, SyncHub};
pub use update::{Severity, TargetPlatform, UpdatePackage, UpdatePhase, Updater, UpdaterEvent};
pub use version::Version;
