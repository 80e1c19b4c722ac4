//! The update state machine.
//!
//! ```text
//! Idle -> Checking -> Found -> Downloading -> Verifying -> Installing -> Committed -> Idle
//!                                   |              |            |
//!                                   +--------------+------------+--> RollingBack -> Idle
//! ```
//!
//! [`Updater`] is severity-agnostic: it checks, downloads and applies what it
//! is told. Callers (the scheduler or a confirmation UI) decide whether a
//! package should be installed.
//!
//! Every install is wrapped in a snapshot. A failed verify or install step
//! restores it, appends a `rollback` log entry, warns the user in-app and
//! returns the error. A failed download changes nothing locally and is only
//! reported.

use crate::error::{Result, TetherError};
use crate::notify::{Channel, NotificationKind, NotificationRequest, NotificationRouter};
use crate::progress::{DownloadProgress, PercentTracker, ProgressCallback};
use crate::snapshot::SnapshotStore;
use crate::state::{StateStore, now_millis};
use crate::sync::{EventBus, SyncEvent, SyncEventKind};
use crate::update::installer::{NoopInstaller, PackageInstaller};
use crate::update::log::{UpdateLog, UpdateLogEntry, UpdateStatus};
use crate::update::package::{TargetPlatform, UpdatePackage};
use crate::update::prefs::{PrefsStore, UpdatePrefs};
use crate::update::source::{PackageTransport, ReleaseSource};
use crate::update::verify::{DigestVerifier, Verifier};
use crate::version::Version;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the local [`UpdaterEvent`] channel.
const EVENT_CAPACITY: usize = 64;

/// Default age after which snapshots are pruned on commit.
const DEFAULT_SNAPSHOT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default bound of the in-memory update log.
const DEFAULT_LOG_ENTRIES: usize = 200;

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Checking,
    /// A package is pending.
    Found,
    Downloading,
    Verifying,
    Installing,
    Committed,
    RollingBack,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Found => "found",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
        };
        f.write_str(s)
    }
}

/// Local observations of the state machine.
///
/// The event bus never echoes to the publishing instance, so the local UI
/// listens here instead (e.g. to raise the blocking prompt for critical
/// packages).
#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    PhaseChanged(UpdatePhase),
    UpdateAvailable(UpdatePackage),
    DownloadProgress(DownloadProgress),
    Installed { from: String, to: String },
    RolledBack { version: String, reason: String },
    DownloadFailed { version: String, reason: String },
}

/// How far [`Updater::advance`] took a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    Superseded,
    Staged,
    Installed,
}

/// Bytes of a downloaded, not yet installed package.
#[derive(Debug, Clone)]
struct StagedPayload {
    package_id: String,
    bytes: Arc<Vec<u8>>,
}

/// Clears the in-flight flag when a check ends, however it ends.
struct CheckInFlight<'a>(&'a AtomicBool);

impl Drop for CheckInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Errors from the verify/install steps always belong to the rollback class.
fn rollback_class(e: TetherError) -> TetherError {
    if e.triggers_rollback() {
        e
    } else {
        TetherError::Install(e.to_string())
    }
}

/// Drives check, download and apply for one instance.
pub struct Updater {
    device_id: String,
    platform: TargetPlatform,
    state: StateStore,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<EventBus>,
    router: Arc<NotificationRouter>,
    source: Arc<dyn ReleaseSource>,
    transport: Arc<dyn PackageTransport>,
    verifier: Arc<dyn Verifier>,
    installer: Arc<dyn PackageInstaller>,
    log: UpdateLog,
    prefs: PrefsStore,
    snapshot_retention: Duration,
    phase: Mutex<UpdatePhase>,
    pending: Mutex<Option<UpdatePackage>>,
    staged: Mutex<Option<StagedPayload>>,
    checking: AtomicBool,
    /// Serializes check, download and apply within the instance.
    pipeline: tokio::sync::Mutex<()>,
    events: broadcast::Sender<UpdaterEvent>,
}

impl Updater {
    pub fn new(
        state: StateStore,
        snapshots: Arc<SnapshotStore>,
        bus: Arc<EventBus>,
        router: Arc<NotificationRouter>,
        source: Arc<dyn ReleaseSource>,
        transport: Arc<dyn PackageTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            device_id: bus.instance_id().to_owned(),
            platform: TargetPlatform::detect(),
            state,
            snapshots,
            bus,
            router,
            source,
            transport,
            verifier: Arc::new(DigestVerifier),
            installer: Arc::new(NoopInstaller),
            log: UpdateLog::new(DEFAULT_LOG_ENTRIES),
            prefs: PrefsStore::new(UpdatePrefs::default()),
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
            phase: Mutex::new(UpdatePhase::Idle),
            pending: Mutex::new(None),
            staged: Mutex::new(None),
            checking: AtomicBool::new(false),
            pipeline: tokio::sync::Mutex::new(()),
            events,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: UpdateLog) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn with_prefs(mut self, prefs: PrefsStore) -> Self {
        self.prefs = prefs;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: TargetPlatform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_snapshot_retention(mut self, retention: Duration) -> Self {
        self.snapshot_retention = retention;
        self
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive local [`UpdaterEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.events.subscribe()
    }

    pub fn current_version(&self) -> String {
        self.state.current_version()
    }

    pub fn pending_package(&self) -> Option<UpdatePackage> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether `package` has been downloaded and awaits apply.
    pub fn is_staged(&self, package: &UpdatePackage) -> bool {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.package_id == package.id)
    }

    pub fn platform(&self) -> TargetPlatform {
        self.platform
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn auto_update(&self) -> bool {
        self.prefs.get().auto_update
    }

    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        self.prefs.update(|p| p.auto_update = enabled)?;
        info!(enabled, "auto-update preference changed");
        Ok(())
    }

    pub fn prefs(&self) -> UpdatePrefs {
        self.prefs.get()
    }

    /// Update log, newest first.
    pub fn logs(&self) -> Vec<UpdateLogEntry> {
        self.log.entries()
    }

    // ── Check ────────────────────────────────────────────────────────

    /// Look for a release newer than the installed version.
    ///
    /// Returns the pending package, or `None` when there is nothing newer or
    /// another check is already running. A silent check only announces the
    /// first discovery of a critical package; repeated silent checks that
    /// confirm the same package stay quiet.
    ///
    /// # Errors
    ///
    /// [`TetherError::Transport`] when the release feed cannot be reached.
    pub async fn check(&self, silent: bool) -> Result<Option<UpdatePackage>> {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("update check already in flight, skipping");
            return Ok(None);
        }
        let _in_flight = CheckInFlight(&self.checking);
        let _pipeline = self.pipeline.lock().await;

        self.set_phase(UpdatePhase::Checking);
        let latest = match self.source.latest(self.platform).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.settle_phase();
                if !silent {
                    self.router
                        .send(
                            NotificationRequest::new(
                                "Update check failed",
                                format!("Could not reach the release feed: {e}"),
                            )
                            .kind(NotificationKind::Error),
                        )
                        .await;
                }
                return Err(e);
            }
        };
        self.record_check();

        let current = self.state.current_version();
        let dismissed = self.prefs.get().dismissed_release;
        let candidate = latest.filter(|p| {
            Version::is_newer(&p.version, &current)
                && (p.severity.is_critical() || dismissed.as_deref() != Some(p.version.as_str()))
        });

        let Some(package) = candidate else {
            self.clear_pending();
            self.set_phase(UpdatePhase::Idle);
            info!(version = %current, "no newer release");
            if !silent {
                self.router
                    .send(
                        NotificationRequest::new(
                            "Up to date",
                            format!("You are running the latest version ({current})."),
                        )
                        .kind(NotificationKind::Success),
                    )
                    .await;
            }
            return Ok(None);
        };

        let newly_found = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let same = pending.as_ref().is_some_and(|p| p.id == package.id);
            *pending = Some(package.clone());
            !same
        };
        if newly_found {
            self.drop_staged_unless(&package);
        }
        self.set_phase(UpdatePhase::Found);

        if newly_found {
            info!(
                version = %package.version,
                severity = %package.severity,
                size = %package.display_size(),
                "update available"
            );
            self.publish_available(&package);
            let _ = self.events.send(UpdaterEvent::UpdateAvailable(package.clone()));
        } else {
            debug!(version = %package.version, "pending update confirmed");
        }

        let loud = package.severity.is_critical() && newly_found;
        if !silent || loud {
            self.announce_available(&package).await;
        }
        Ok(Some(package))
    }

    fn publish_available(&self, package: &UpdatePackage) {
        let mut event = SyncEvent::new(SyncEventKind::UpdateAvailable).with_entity(&package.version);
        match serde_json::to_value(package) {
            Ok(value) => event = event.with_payload(value),
            Err(e) => warn!(error = %e, "cannot encode update package for sync"),
        }
        self.bus.publish(event);
    }

    async fn announce_available(&self, package: &UpdatePackage) {
        let (title, kind) = if package.severity.is_critical() {
            ("Critical update available", NotificationKind::Warning)
        } else {
            ("Update available", NotificationKind::Update)
        };
        let mut message = format!("Version {} is ready to install.", package.version);
        if let Some(first) = package.changelog.first() {
            message.push_str(&format!(" {first}"));
        }
        self.router
            .send(
                NotificationRequest::new(title, message)
                    .kind(kind)
                    .channels(package.severity.announcement_channels()),
            )
            .await;
    }

    fn record_check(&self) {
        if let Err(e) = self.prefs.update(|p| p.last_check = Some(now_millis())) {
            warn!(error = %e, "cannot record update check time");
        }
    }

    // ── Download ─────────────────────────────────────────────────────

    /// Fetch `package` and stage its bytes for [`Updater::apply`].
    ///
    /// `on_progress` receives non-decreasing percentages starting at 0 and,
    /// on success, ending at exactly 100. Cancelling `cancel` abandons the
    /// transfer.
    ///
    /// # Errors
    ///
    /// [`TetherError::Transport`] on any transfer failure or cancellation.
    /// Nothing local has changed in that case.
    pub async fn download(
        &self,
        package: &UpdatePackage,
        on_progress: ProgressCallback<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let _pipeline = self.pipeline.lock().await;
        self.download_locked(package, on_progress, cancel).await
    }

    async fn download_locked(
        &self,
        package: &UpdatePackage,
        on_progress: ProgressCallback<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.set_phase(UpdatePhase::Downloading);
        info!(version = %package.version, location = %package.download_location, "downloading update");

        let events = &self.events;
        let mut tracker = PercentTracker::new(package.size_bytes);
        if let Some(percent) = tracker.start() {
            on_progress(percent);
            let _ = events.send(UpdaterEvent::DownloadProgress(tracker.sample()));
        }

        let fetched = {
            let mut on_chunk = |bytes: u64| {
                if let Some(percent) = tracker.advance(bytes) {
                    on_progress(percent);
                    let _ = events.send(UpdaterEvent::DownloadProgress(tracker.sample()));
                }
            };
            let fetch = self.transport.fetch(package, &mut on_chunk);
            match cancel {
                Some(token) => tokio::select! {
                    result = fetch => result,
                    () = token.cancelled() => {
                        Err(TetherError::Transport("download cancelled".to_owned()))
                    }
                },
                None => fetch.await,
            }
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                let e = match e {
                    TetherError::Transport(_) => e,
                    other => TetherError::Transport(other.to_string()),
                };
                self.fail_download(package, &e).await;
                return Err(e);
            }
        };

        if let Some(percent) = tracker.finish() {
            on_progress(percent);
            let _ = events.send(UpdaterEvent::DownloadProgress(tracker.sample()));
        }
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(StagedPayload {
            package_id: package.id.clone(),
            bytes: Arc::new(bytes),
        });
        info!(version = %package.version, bytes = tracker.bytes_received(), "update downloaded");
        self.settle_phase();
        Ok(())
    }

    async fn fail_download(&self, package: &UpdatePackage, e: &TetherError) {
        self.set_phase(UpdatePhase::RollingBack);
        warn!(version = %package.version, error = %e, "update download failed");

        let from = self.state.current_version();
        self.append_log(UpdateLogEntry::new(
            &self.device_id,
            &from,
            &package.version,
            UpdateStatus::Failed,
            e.to_string(),
        ));
        let _ = self.events.send(UpdaterEvent::DownloadFailed {
            version: package.version.clone(),
            reason: e.to_string(),
        });
        self.router
            .send(
                NotificationRequest::new(
                    "Download failed",
                    format!("Version {} could not be downloaded: {e}", package.version),
                )
                .kind(NotificationKind::Error),
            )
            .await;
        self.set_phase(UpdatePhase::Idle);
    }

    // ── Apply ────────────────────────────────────────────────────────

    /// Install a downloaded `package` under a snapshot.
    ///
    /// # Errors
    ///
    /// [`TetherError::Integrity`] or [`TetherError::Install`] after the
    /// snapshot has been restored. [`TetherError::Storage`] if the snapshot
    /// itself cannot be captured, in which case nothing was attempted.
    pub async fn apply(&self, package: &UpdatePackage) -> Result<()> {
        let _pipeline = self.pipeline.lock().await;
        self.apply_locked(package).await
    }

    async fn apply_locked(&self, package: &UpdatePackage) -> Result<()> {
        let from = self.state.current_version();
        let snapshot_id = self.snapshots.capture()?;
        info!(from = %from, to = %package.version, snapshot = %snapshot_id, "applying update");

        match self.verify_and_install(package).await {
            Ok(()) => {
                self.commit(package, &from).await;
                Ok(())
            }
            Err(e) => {
                self.roll_back(package, &from, &snapshot_id, &e).await;
                Err(e)
            }
        }
    }

    async fn verify_and_install(&self, package: &UpdatePackage) -> Result<()> {
        self.set_phase(UpdatePhase::Verifying);
        let payload = self
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|s| s.package_id == package.id)
            .map(|s| Arc::clone(&s.bytes))
            .ok_or_else(|| TetherError::Integrity {
                expected: package.integrity_digest.clone(),
                actual: "no downloaded payload".to_owned(),
            })?;
        self.verifier
            .verify(package, &payload)
            .await
            .map_err(rollback_class)?;

        self.set_phase(UpdatePhase::Installing);
        self.installer
            .install(package, &payload)
            .await
            .map_err(rollback_class)?;
        self.state
            .set_version(&package.version)
            .map_err(rollback_class)
    }

    async fn commit(&self, package: &UpdatePackage, from: &str) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending
                .as_ref()
                .is_some_and(|p| !Version::is_newer(&p.version, &package.version))
            {
                *pending = None;
            }
        }
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = None;

        self.append_log(UpdateLogEntry::new(
            &self.device_id,
            from,
            &package.version,
            UpdateStatus::Success,
            format!("Installed {}", package.version),
        ));
        self.set_phase(UpdatePhase::Committed);
        info!(from = %from, to = %package.version, "update committed");
        let _ = self.events.send(UpdaterEvent::Installed {
            from: from.to_owned(),
            to: package.version.clone(),
        });
        self.router
            .send(
                NotificationRequest::new(
                    "Update installed",
                    format!("Version {} is now installed.", package.version),
                )
                .kind(NotificationKind::Success)
                .channels(&[Channel::InApp, Channel::OsPush]),
            )
            .await;

        let retention = i64::try_from(self.snapshot_retention.as_millis()).unwrap_or(i64::MAX);
        match self.snapshots.discard_older_than(retention, now_millis()) {
            Ok(0) => {}
            Ok(discarded) => debug!(discarded, "old snapshots discarded"),
            Err(e) => warn!(error = %e, "cannot discard old snapshots"),
        }
        self.set_phase(UpdatePhase::Idle);
    }

    async fn roll_back(&self, package: &UpdatePackage, from: &str, snapshot_id: &str, e: &TetherError) {
        self.set_phase(UpdatePhase::RollingBack);
        warn!(version = %package.version, error = %e, snapshot = %snapshot_id, "update failed, rolling back");

        if let Err(restore_err) = self.snapshots.restore(snapshot_id) {
            error!(snapshot = %snapshot_id, error = %restore_err, "snapshot restore failed");
        }
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = None;

        self.append_log(UpdateLogEntry::new(
            &self.device_id,
            from,
            &package.version,
            UpdateStatus::Rollback,
            e.to_string(),
        ));
        let _ = self.events.send(UpdaterEvent::RolledBack {
            version: package.version.clone(),
            reason: e.to_string(),
        });
        self.router
            .send(
                NotificationRequest::new(
                    "Update rolled back",
                    format!(
                        "Version {} could not be installed ({e}). Restored version {from}.",
                        package.version
                    ),
                )
                .kind(NotificationKind::Warning),
            )
            .await;
        self.set_phase(UpdatePhase::Idle);
    }

    // ── User decisions ───────────────────────────────────────────────

    /// Skip the pending package. Later checks ignore its version until a
    /// newer one appears. Critical packages cannot be dismissed.
    ///
    /// Returns `false` if nothing was dismissed.
    pub fn dismiss(&self) -> Result<bool> {
        let version = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let Some(package) = pending.as_ref() else {
                return Ok(false);
            };
            if package.severity.is_critical() {
                warn!(version = %package.version, "critical update cannot be dismissed");
                return Ok(false);
            }
            let version = package.version.clone();
            self.prefs
                .update(|p| p.dismissed_release = Some(version.clone()))?;
            *pending = None;
            version
        };
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_phase(UpdatePhase::Idle);
        info!(version = %version, "update dismissed");
        Ok(true)
    }

    /// Explicit confirmation: install the pending package, downloading it
    /// first if needed. Returns the installed version, or `None` if nothing
    /// was pending.
    pub async fn confirm_install(&self) -> Result<Option<String>> {
        let _pipeline = self.pipeline.lock().await;
        let Some(package) = self.pending_package() else {
            return Ok(None);
        };
        info!(version = %package.version, "install confirmed");
        if !self.is_staged(&package) {
            self.download_locked(&package, &mut |_| {}, None).await?;
        }
        self.apply_locked(&package).await?;
        Ok(Some(package.version))
    }

    /// Download `package` if needed and, when `install` is set, apply it, all
    /// under one hold of the pipeline.
    ///
    /// Returns [`Advance::Superseded`] without touching anything when
    /// `package` stopped being the pending package since the caller's check
    /// (installed, dismissed or replaced in the meantime).
    pub(crate) async fn advance(&self, package: &UpdatePackage, install: bool) -> Result<Advance> {
        let _pipeline = self.pipeline.lock().await;
        let still_pending = self
            .pending_package()
            .is_some_and(|p| p.id == package.id);
        if !still_pending {
            debug!(version = %package.version, "package no longer pending, skipping");
            return Ok(Advance::Superseded);
        }

        if !self.is_staged(package) {
            self.download_locked(package, &mut |_| {}, None).await?;
        }
        if !install {
            return Ok(Advance::Staged);
        }
        self.apply_locked(package).await?;
        Ok(Advance::Installed)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn set_phase(&self, next: UpdatePhase) {
        let prev = {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *phase, next)
        };
        if prev != next {
            debug!(from = %prev, to = %next, "updater phase");
            let _ = self.events.send(UpdaterEvent::PhaseChanged(next));
        }
    }

    /// `Found` while a package is pending, `Idle` otherwise.
    fn settle_phase(&self) {
        let next = if self.pending_package().is_some() {
            UpdatePhase::Found
        } else {
            UpdatePhase::Idle
        };
        self.set_phase(next);
    }

    fn clear_pending(&self) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn drop_staged_unless(&self, package: &UpdatePackage) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        if staged.as_ref().is_some_and(|s| s.package_id != package.id) {
            *staged = None;
        }
    }

    fn append_log(&self, entry: UpdateLogEntry) {
        if let Err(e) = self.log.append(entry) {
            warn!(error = %e, "cannot append update log entry");
        }
    }
}

impl fmt::Debug for Updater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updater")
            .field("device_id", &self.device_id)
            .field("platform", &self.platform)
            .field("phase", &self.phase())
            .field("current_version", &self.current_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::notify::{LogPushBackend, PushBackend};
    use crate::sync::SyncHub;
    use crate::update::package::Severity;
    use crate::update::source::InMemoryFeed;
    use async_trait::async_trait;

    struct Harness {
        updater: Updater,
        feed: Arc<InMemoryFeed>,
        router: Arc<NotificationRouter>,
        push: Arc<LogPushBackend>,
        state: StateStore,
        snapshots: Arc<SnapshotStore>,
        _hub: SyncHub,
    }

    fn harness() -> Harness {
        harness_with(|u| u)
    }

    fn harness_with(configure: impl FnOnce(Updater) -> Updater) -> Harness {
        let feed = Arc::new(InMemoryFeed::new().with_chunk_size(7));
        let source: Arc<dyn ReleaseSource> = Arc::clone(&feed) as Arc<dyn ReleaseSource>;
        build(feed, source, configure)
    }

    fn build(
        feed: Arc<InMemoryFeed>,
        source: Arc<dyn ReleaseSource>,
        configure: impl FnOnce(Updater) -> Updater,
    ) -> Harness {
        let hub = SyncHub::new(16);
        let bus = Arc::new(hub.join_as("device-a"));
        let state = StateStore::in_memory("alice", "11.0.0");
        let snapshots = Arc::new(SnapshotStore::new(state.clone(), 5));
        let push = Arc::new(LogPushBackend::granted());
        let push_backend: Arc<dyn PushBackend> = Arc::clone(&push) as Arc<dyn PushBackend>;
        let router = Arc::new(NotificationRouter::new(push_backend));
        let transport: Arc<dyn PackageTransport> = Arc::clone(&feed) as Arc<dyn PackageTransport>;
        let updater = Updater::new(
            state.clone(),
            Arc::clone(&snapshots),
            bus,
            Arc::clone(&router),
            source,
            transport,
        )
        .with_platform(TargetPlatform::Linux);
        Harness {
            updater: configure(updater),
            feed,
            router,
            push,
            state,
            snapshots,
            _hub: hub,
        }
    }

    /// Feed whose lookups take a while, so overlapping checks really overlap.
    struct SlowFeed(Arc<InMemoryFeed>);

    #[async_trait]
    impl ReleaseSource for SlowFeed {
        async fn latest(&self, platform: TargetPlatform) -> Result<Option<UpdatePackage>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.latest(platform).await
        }
    }

    fn release(feed: &InMemoryFeed, version: &str, severity: Severity) -> UpdatePackage {
        let payload = format!("payload for {version}").into_bytes();
        let pkg = UpdatePackage::for_payload(version, severity, TargetPlatform::Linux, &payload);
        feed.publish(pkg.clone(), payload);
        pkg
    }

    struct FailingInstaller;

    #[async_trait]
    impl PackageInstaller for FailingInstaller {
        async fn install(&self, _package: &UpdatePackage, _payload: &[u8]) -> Result<()> {
            Err(TetherError::Install("disk full".to_owned()))
        }
    }

    /// Writes the new version and settings, then fails before finishing.
    #[derive(Default)]
    struct PartialInstaller {
        state: Mutex<Option<StateStore>>,
    }

    #[async_trait]
    impl PackageInstaller for PartialInstaller {
        async fn install(&self, package: &UpdatePackage, _payload: &[u8]) -> Result<()> {
            let state = self.state.lock().unwrap().clone().unwrap();
            state.set_version(&package.version)?;
            state.update_settings(|s| {
                s.language = "xx".to_owned();
                s.notifications_enabled = false;
            })?;
            Err(TetherError::Install("post-install hook failed".to_owned()))
        }
    }

    #[tokio::test]
    async fn check_finds_newer_release() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);

        let found = h.updater.check(false).await.unwrap().unwrap();
        assert_eq!(found.id, pkg.id);
        assert_eq!(h.updater.pending_package().unwrap().id, pkg.id);
        assert_eq!(h.updater.phase(), UpdatePhase::Found);
        assert_eq!(h.router.inbox()[0].title, "Update available");
        assert!(h.updater.prefs().last_check.is_some());
    }

    #[tokio::test]
    async fn equal_version_is_not_an_update() {
        let h = harness();
        release(&h.feed, "11.0.0", Severity::Feature);

        assert!(h.updater.check(false).await.unwrap().is_none());
        assert_eq!(h.router.inbox()[0].title, "Up to date");
        assert_eq!(h.updater.phase(), UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn silent_check_with_nothing_new_is_quiet() {
        let h = harness();
        assert!(h.updater.check(true).await.unwrap().is_none());
        assert!(h.router.inbox().is_empty());
    }

    #[tokio::test]
    async fn repeated_silent_checks_do_not_renotify() {
        let h = harness();
        release(&h.feed, "11.1.0", Severity::Critical);
        let mut events = h.updater.subscribe();

        h.updater.check(true).await.unwrap();
        h.updater.check(true).await.unwrap();
        h.updater.check(true).await.unwrap();

        assert_eq!(h.router.inbox().len(), 1);
        assert_eq!(h.push.delivered().len(), 1);
        assert_eq!(h.updater.current_version(), "11.0.0");

        let mut available = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UpdaterEvent::UpdateAvailable(_)) {
                available += 1;
            }
        }
        assert_eq!(available, 1);
    }

    #[tokio::test]
    async fn silent_non_critical_discovery_is_not_announced() {
        let h = harness();
        release(&h.feed, "11.1.0", Severity::Maintenance);
        assert!(h.updater.check(true).await.unwrap().is_some());
        assert!(h.router.inbox().is_empty());
    }

    #[tokio::test]
    async fn failed_lookup_is_a_transport_error() {
        let h = harness();
        h.feed.fail_next_checks(1);
        let err = h.updater.check(true).await.unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
        assert_eq!(h.updater.phase(), UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn download_progress_is_monotonic_and_ends_at_100() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);

        let mut seen = Vec::new();
        h.updater
            .download(&pkg, &mut |p| seen.push(p), None)
            .await
            .unwrap();

        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(h.updater.is_staged(&pkg));
    }

    #[tokio::test]
    async fn download_failure_changes_nothing() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        h.updater.check(true).await.unwrap();
        h.feed.fail_next_downloads(1);

        let err = h.updater.download(&pkg, &mut |_| {}, None).await.unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
        assert_eq!(h.updater.current_version(), "11.0.0");
        assert!(h.snapshots.is_empty());
        assert!(!h.updater.is_staged(&pkg));
        assert_eq!(h.updater.logs()[0].status, UpdateStatus::Failed);
        assert_eq!(h.router.inbox()[0].kind, NotificationKind::Error);
        assert!(h.updater.pending_package().is_some());
    }

    #[tokio::test]
    async fn cancelled_download_is_a_transport_error() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .updater
            .download(&pkg, &mut |_| {}, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
        assert!(!h.updater.is_staged(&pkg));
    }

    #[tokio::test]
    async fn apply_commits_and_clears_pending() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        h.updater.check(true).await.unwrap();
        h.updater.download(&pkg, &mut |_| {}, None).await.unwrap();

        h.updater.apply(&pkg).await.unwrap();

        assert_eq!(h.updater.current_version(), "11.1.0");
        assert!(h.updater.pending_package().is_none());
        let log = h.updater.logs();
        assert_eq!(log[0].status, UpdateStatus::Success);
        assert_eq!(log[0].version_from, "11.0.0");
        assert_eq!(log[0].version_to, "11.1.0");
        assert_eq!(log[0].device_id, "device-a");
        assert_eq!(h.push.delivered()[0].0, "Update installed");
        assert_eq!(h.updater.phase(), UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn integrity_failure_restores_snapshot_exactly() {
        let h = harness();
        let mut pkg = release(&h.feed, "11.1.0", Severity::Feature);
        pkg.integrity_digest = crate::integrity::digest_of(b"something else");
        h.state.update_settings(|s| s.theme = "light".to_owned()).unwrap();
        let before = h.state.read_consistent();

        h.updater.download(&pkg, &mut |_| {}, None).await.unwrap();
        let err = h.updater.apply(&pkg).await.unwrap_err();

        assert!(matches!(err, TetherError::Integrity { .. }));
        assert_eq!(h.state.read_consistent(), before);
        assert_eq!(h.updater.logs().len(), 1);
        assert_eq!(h.updater.logs()[0].status, UpdateStatus::Rollback);
        let warning = &h.router.inbox()[0];
        assert_eq!(warning.kind, NotificationKind::Warning);
        assert!(h.push.delivered().is_empty());
    }

    #[tokio::test]
    async fn install_failure_rolls_back_and_keeps_pending() {
        let h = harness_with(|u| u.with_installer(Arc::new(FailingInstaller)));
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        h.updater.check(true).await.unwrap();
        h.updater.download(&pkg, &mut |_| {}, None).await.unwrap();

        let err = h.updater.apply(&pkg).await.unwrap_err();

        assert!(matches!(err, TetherError::Install(_)));
        assert_eq!(h.updater.current_version(), "11.0.0");
        assert_eq!(h.updater.pending_package().unwrap().id, pkg.id);
        assert_eq!(h.updater.phase(), UpdatePhase::Idle);
        assert_eq!(h.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn install_failure_restores_snapshot_exactly() {
        let installer = Arc::new(PartialInstaller::default());
        let h = harness_with({
            let installer: Arc<dyn PackageInstaller> = installer.clone();
            move |u| u.with_installer(installer)
        });
        *installer.state.lock().unwrap() = Some(h.state.clone());
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        h.state
            .update_settings(|s| {
                s.theme = "light".to_owned();
                s.language = "fr".to_owned();
            })
            .unwrap();
        let before = h.state.read_consistent();

        h.updater.download(&pkg, &mut |_| {}, None).await.unwrap();
        let err = h.updater.apply(&pkg).await.unwrap_err();

        assert!(matches!(err, TetherError::Install(_)));
        assert_eq!(h.state.read_consistent(), before);
        let log = h.updater.logs();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, UpdateStatus::Rollback);
        assert_eq!(log[0].version_from, "11.0.0");
        assert_eq!(h.router.inbox()[0].kind, NotificationKind::Warning);
    }

    #[tokio::test]
    async fn apply_without_download_rolls_back() {
        let h = harness();
        let pkg = release(&h.feed, "11.1.0", Severity::Feature);
        let err = h.updater.apply(&pkg).await.unwrap_err();
        assert!(err.triggers_rollback());
        assert_eq!(h.updater.logs()[0].status, UpdateStatus::Rollback);
    }

    #[tokio::test]
    async fn dismissed_release_is_skipped_until_a_newer_one() {
        let h = harness();
        release(&h.feed, "11.1.0", Severity::Feature);
        h.updater.check(true).await.unwrap();

        assert!(h.updater.dismiss().unwrap());
        assert!(h.updater.pending_package().is_none());
        assert!(h.updater.check(true).await.unwrap().is_none());

        release(&h.feed, "11.2.0", Severity::Feature);
        let found = h.updater.check(true).await.unwrap().unwrap();
        assert_eq!(found.version, "11.2.0");
    }

    #[tokio::test]
    async fn critical_release_cannot_be_dismissed() {
        let h = harness();
        release(&h.feed, "11.1.0", Severity::Critical);
        h.updater.check(true).await.unwrap();

        assert!(!h.updater.dismiss().unwrap());
        assert!(h.updater.pending_package().is_some());
    }

    #[tokio::test]
    async fn confirm_install_downloads_when_needed() {
        let h = harness();
        release(&h.feed, "11.1.0", Severity::Critical);
        assert_eq!(h.updater.confirm_install().await.unwrap(), None);

        h.updater.check(true).await.unwrap();
        let installed = h.updater.confirm_install().await.unwrap();
        assert_eq!(installed.as_deref(), Some("11.1.0"));
        assert_eq!(h.updater.current_version(), "11.1.0");
    }

    #[tokio::test]
    async fn concurrent_check_is_a_noop() {
        let feed = Arc::new(InMemoryFeed::new());
        let slow: Arc<dyn ReleaseSource> = Arc::new(SlowFeed(Arc::clone(&feed)));
        let h = build(feed, slow, |u| u);
        release(&h.feed, "11.1.0", Severity::Feature);

        let (a, b) = tokio::join!(h.updater.check(true), h.updater.check(true));
        let found = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(found, 1);
    }

    #[tokio::test]
    async fn auto_update_preference_round_trips() {
        let h = harness();
        assert!(h.updater.auto_update());
        h.updater.set_auto_update(false).unwrap();
        assert!(!h.updater.auto_update());
    }
}
