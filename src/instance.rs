//! One running application instance.
//!
//! [`Instance`] wires the state store, snapshot store, event bus, notification
//! router, updater and scheduler for one user, and is the surface the rest of
//! the application talks to.

use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::notify::{LogPushBackend, NotificationRouter, PushBackend};
use crate::scheduler::{AutoUpdateScheduler, SchedulerHandle};
use crate::snapshot::SnapshotStore;
use crate::state::{SettingsRecord, StateStore};
use crate::sync::{EventBus, LastWriteWins, SubscriptionHandle, SyncEvent, SyncEventKind, SyncHub};
use crate::update::{
    ArtifactInstaller, FileFeed, InMemoryFeed, NoopInstaller, PackageInstaller, PackageTransport,
    PrefsStore, ReleaseSource, TargetPlatform, UpdateLog, UpdatePackage, UpdatePrefs, Updater,
    Verifier,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.json";
const PREFS_FILE: &str = "prefs.json";
const LOG_FILE: &str = "update-log.json";
const SNAPSHOTS_FILE: &str = "snapshots.json";

/// Builds an [`Instance`] from configuration plus optional overrides.
pub struct InstanceBuilder {
    config: TetherConfig,
    hub: SyncHub,
    instance_id: Option<String>,
    feed: Option<(Arc<dyn ReleaseSource>, Arc<dyn PackageTransport>)>,
    push: Option<Arc<dyn PushBackend>>,
    verifier: Option<Arc<dyn Verifier>>,
    installer: Option<Arc<dyn PackageInstaller>>,
}

impl InstanceBuilder {
    pub fn new(config: TetherConfig, hub: &SyncHub) -> Self {
        Self {
            config,
            hub: hub.clone(),
            instance_id: None,
            feed: None,
            push: None,
            verifier: None,
            installer: None,
        }
    }

    /// Use a fixed instance id instead of a random one.
    #[must_use]
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Release feed serving both lookups and downloads.
    #[must_use]
    pub fn feed<F>(mut self, feed: Arc<F>) -> Self
    where
        F: ReleaseSource + PackageTransport + 'static,
    {
        let source: Arc<dyn ReleaseSource> = Arc::clone(&feed) as Arc<dyn ReleaseSource>;
        let transport: Arc<dyn PackageTransport> = feed as Arc<dyn PackageTransport>;
        self.feed = Some((source, transport));
        self
    }

    #[must_use]
    pub fn push_backend(mut self, push: Arc<dyn PushBackend>) -> Self {
        self.push = Some(push);
        self
    }

    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[must_use]
    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Open persisted state (if a data directory is configured) and join the hub.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TetherError::Config`] for invalid configuration, [`TetherError::Storage`]
    /// if persisted state cannot be read.
    pub fn build(self) -> Result<Instance> {
        let config = self.config;
        config.validate()?;

        let platform = match config.updates.platform.as_deref() {
            Some(name) => name
                .parse::<TargetPlatform>()
                .map_err(TetherError::Config)?,
            None => TargetPlatform::detect(),
        };

        let user_id = config.instance.user_id.as_str();
        let baseline = config.updates.baseline_version.as_str();
        let retention = &config.retention;
        let pref_defaults = UpdatePrefs {
            auto_update: config.updates.auto_update,
            ..UpdatePrefs::default()
        };

        let (state, snapshots, log, prefs) = match config.instance.data_dir.as_deref() {
            Some(dir) => open_persisted(dir, user_id, baseline, &config, pref_defaults)?,
            None => {
                let state = StateStore::in_memory(user_id, baseline);
                let snapshots = SnapshotStore::new(state.clone(), retention.max_snapshots);
                (
                    state,
                    snapshots,
                    UpdateLog::new(retention.max_log_entries),
                    PrefsStore::new(pref_defaults),
                )
            }
        };
        let snapshots = Arc::new(snapshots);

        let bus = Arc::new(match self.instance_id {
            Some(id) => self.hub.join_as(id),
            None => self.hub.join(),
        });
        let push = self
            .push
            .unwrap_or_else(|| Arc::new(LogPushBackend::granted()) as Arc<dyn PushBackend>);
        let router = Arc::new(NotificationRouter::new(push));

        let (source, transport) = match self.feed {
            Some(feed) => feed,
            None => default_feed(&config),
        };
        let installer = self.installer.unwrap_or_else(|| match &config.updates.artifact_dir {
            Some(dir) => Arc::new(ArtifactInstaller::new(dir)) as Arc<dyn PackageInstaller>,
            None => Arc::new(NoopInstaller) as Arc<dyn PackageInstaller>,
        });

        let mut updater = Updater::new(
            state.clone(),
            Arc::clone(&snapshots),
            Arc::clone(&bus),
            Arc::clone(&router),
            source,
            transport,
        )
        .with_platform(platform)
        .with_installer(installer)
        .with_log(log)
        .with_prefs(prefs)
        .with_snapshot_retention(Duration::from_secs(retention.snapshot_retention_secs));
        if let Some(verifier) = self.verifier {
            updater = updater.with_verifier(verifier);
        }
        let updater = Arc::new(updater);

        let scheduler = Arc::new(AutoUpdateScheduler::new(
            Arc::clone(&updater),
            Duration::from_secs(config.scheduler.interval_secs),
        ));

        let settings_clock = Arc::new(Mutex::new(LastWriteWins::new()));
        let current = state.settings();
        if current.updated_at > 0 {
            settings_clock
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .offer(current.updated_at, bus.instance_id());
        }
        let sync_subscription = subscribe_remote_changes(&bus, &state, &settings_clock);

        info!(
            instance = %bus.instance_id(),
            user = %state.user_id(),
            version = %state.current_version(),
            platform = %platform,
            persisted = config.instance.data_dir.is_some(),
            "instance started"
        );

        Ok(Instance {
            config,
            state,
            snapshots,
            bus,
            router,
            updater,
            scheduler,
            settings_clock,
            sync_subscription,
        })
    }
}

type Stores = (StateStore, SnapshotStore, UpdateLog, PrefsStore);

fn open_persisted(
    dir: &Path,
    user_id: &str,
    baseline: &str,
    config: &TetherConfig,
    pref_defaults: UpdatePrefs,
) -> Result<Stores> {
    let retention = &config.retention;
    let state = StateStore::open(dir.join(STATE_FILE), user_id, baseline)?;
    let snapshots = SnapshotStore::open(
        state.clone(),
        retention.max_snapshots,
        dir.join(SNAPSHOTS_FILE),
    )?;
    let log = UpdateLog::open(dir.join(LOG_FILE), retention.max_log_entries)?;
    let prefs = PrefsStore::open(dir.join(PREFS_FILE), pref_defaults)?;
    Ok((state, snapshots, log, prefs))
}

fn default_feed(config: &TetherConfig) -> (Arc<dyn ReleaseSource>, Arc<dyn PackageTransport>) {
    match &config.updates.manifest_path {
        Some(path) => {
            let feed = Arc::new(FileFeed::new(path));
            (
                Arc::clone(&feed) as Arc<dyn ReleaseSource>,
                feed as Arc<dyn PackageTransport>,
            )
        }
        None => {
            debug!("no release manifest configured, using an empty in-memory feed");
            let feed = Arc::new(InMemoryFeed::new());
            (
                Arc::clone(&feed) as Arc<dyn ReleaseSource>,
                feed as Arc<dyn PackageTransport>,
            )
        }
    }
}

/// Apply winning `settings-changed` events from other instances.
fn subscribe_remote_changes(
    bus: &EventBus,
    state: &StateStore,
    clock: &Arc<Mutex<LastWriteWins>>,
) -> SubscriptionHandle {
    let state = state.clone();
    let clock = Arc::clone(clock);
    bus.subscribe(move |event| match event.kind {
        SyncEventKind::SettingsChanged => apply_remote_settings(&state, &clock, event),
        SyncEventKind::UpdateAvailable => {
            info!(
                source = %event.source_instance_id,
                version = event.entity_id.as_deref().unwrap_or("unknown"),
                "another instance found an update"
            );
        }
        SyncEventKind::ContentChanged => {
            debug!(
                source = %event.source_instance_id,
                entity = event.entity_id.as_deref().unwrap_or(""),
                "remote content changed"
            );
        }
    })
}

fn apply_remote_settings(state: &StateStore, clock: &Mutex<LastWriteWins>, event: &SyncEvent) {
    let Some(payload) = event.payload.clone() else {
        debug!(source = %event.source_instance_id, "settings-changed without payload");
        return;
    };
    let record: SettingsRecord = match serde_json::from_value(payload) {
        Ok(record) => record,
        Err(e) => {
            warn!(source = %event.source_instance_id, error = %e, "ignoring malformed settings payload");
            return;
        }
    };
    if record.user_id != state.user_id() {
        return;
    }

    // Held until the record is stored so a concurrent local edit cannot interleave.
    let mut clock = clock.lock().unwrap_or_else(|e| e.into_inner());
    if !clock.offer(record.updated_at, &event.source_instance_id) {
        debug!(source = %event.source_instance_id, "stale settings write ignored");
        return;
    }
    match state.replace_settings(record) {
        Ok(()) => info!(source = %event.source_instance_id, "settings merged from another instance"),
        Err(e) => warn!(error = %e, "cannot store merged settings"),
    }
}

/// A running instance.
pub struct Instance {
    config: TetherConfig,
    state: StateStore,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<EventBus>,
    router: Arc<NotificationRouter>,
    updater: Arc<Updater>,
    scheduler: Arc<AutoUpdateScheduler>,
    settings_clock: Arc<Mutex<LastWriteWins>>,
    sync_subscription: SubscriptionHandle,
}

impl Instance {
    pub fn builder(config: TetherConfig, hub: &SyncHub) -> InstanceBuilder {
        InstanceBuilder::new(config, hub)
    }

    pub fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn notifications(&self) -> &NotificationRouter {
        &self.router
    }

    pub fn updater(&self) -> &Arc<Updater> {
        &self.updater
    }

    pub fn scheduler(&self) -> &Arc<AutoUpdateScheduler> {
        &self.scheduler
    }

    pub fn current_version(&self) -> String {
        self.updater.current_version()
    }

    pub fn pending_package(&self) -> Option<UpdatePackage> {
        self.updater.pending_package()
    }

    pub fn settings(&self) -> SettingsRecord {
        self.state.settings()
    }

    /// Change the settings record and tell the other instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the new record cannot be persisted; nothing is
    /// published in that case.
    pub fn update_settings<F>(&self, mutate: F) -> Result<SettingsRecord>
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let record = {
            let mut clock = self.settings_clock.lock().unwrap_or_else(|e| e.into_inner());
            // Stamp past every accepted write, local or remote.
            let not_before = clock.latest().map_or(i64::MIN, |(ts, _)| ts.saturating_add(1));
            let record = self.state.update_settings_after(not_before, mutate)?;
            clock.offer(record.updated_at, self.bus.instance_id());
            record
        };

        let payload = serde_json::to_value(&record)
            .map_err(|e| TetherError::Storage(format!("cannot encode settings: {e}")))?;
        self.bus.publish(
            SyncEvent::new(SyncEventKind::SettingsChanged)
                .with_entity(record.user_id.clone())
                .with_payload(payload),
        );
        Ok(record)
    }

    /// Tell the other instances that a piece of content changed.
    pub fn publish_content_changed(&self, entity_id: &str) -> SyncEvent {
        self.bus
            .publish(SyncEvent::new(SyncEventKind::ContentChanged).with_entity(entity_id))
    }

    /// Start the auto-update loop if enabled in configuration.
    pub fn start_scheduler(&self) -> Option<SchedulerHandle> {
        if !self.config.scheduler.enabled {
            info!("auto-update scheduler disabled by configuration");
            return None;
        }
        Some(Arc::clone(&self.scheduler).run())
    }

    /// Stop receiving events from other instances.
    pub fn leave(&self) {
        self.bus.unsubscribe(self.sync_subscription);
        self.bus.leave();
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("instance_id", &self.instance_id())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
