//! Update distribution: release lookup, download, verification, install and
//! rollback.
//!
//! [`Updater`] owns the installed-version pointer and the single pending
//! package of an instance. Release feeds, verification and installation sit
//! behind traits so hosts (and tests) can swap them.

pub mod installer;
pub mod log;
pub mod package;
pub mod prefs;
pub mod source;
pub mod updater;
pub mod verify;

pub use installer::{ArtifactInstaller, NoopInstaller, PackageInstaller};
pub use log::{UpdateLog, UpdateLogEntry, UpdateStatus};
pub use package::{Severity, TargetPlatform, UpdatePackage};
pub use prefs::{PrefsStore, UpdatePrefs};
pub use source::{FileFeed, InMemoryFeed, PackageTransport, ReleaseManifest, ReleaseSource};
pub use updater::{UpdatePhase, Updater, UpdaterEvent};
pub use verify::{DigestVerifier, Verifier};
