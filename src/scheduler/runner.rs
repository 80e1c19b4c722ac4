//! Auto-update background loop.
//!
//! Spawns a tokio task that periodically runs one [`AutoUpdateScheduler::tick`]:
//! a silent check, then download and (for non-critical packages) apply when
//! the user allows automatic updates. Failures are logged and swallowed so the
//! loop never takes the host down.

use crate::scheduler::tick::{TickHistory, TickOutcome, TickRecord};
use crate::state::now_millis;
use crate::error::TetherError;
use crate::update::updater::Advance;
use crate::update::{UpdatePackage, Updater};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of tick records to keep.
const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Periodic driver of one instance's [`Updater`].
pub struct AutoUpdateScheduler {
    updater: Arc<Updater>,
    interval: Duration,
    history: Mutex<TickHistory>,
}

impl AutoUpdateScheduler {
    pub fn new(updater: Arc<Updater>, interval: Duration) -> Self {
        Self {
            updater,
            interval: interval.max(Duration::from_millis(1)),
            history: Mutex::new(TickHistory::new(DEFAULT_HISTORY_LIMIT)),
        }
    }

    /// Override the run-history limit.
    #[must_use]
    pub fn with_history_limit(self, max_entries: usize) -> Self {
        Self {
            history: Mutex::new(TickHistory::new(max_entries)),
            ..self
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Recent ticks, oldest first.
    pub fn history(&self) -> Vec<TickRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records()
            .to_vec()
    }

    /// Start the background loop.
    ///
    /// The first tick runs immediately unless the last recorded check is more
    /// recent than one interval. A tick in progress always completes before
    /// the loop observes cancellation.
    pub fn run(self: Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let first = Instant::now() + self.initial_delay();
            let mut interval = tokio::time::interval_at(first, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                "auto-update scheduler started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let outcome = self.tick().await;
                        debug!(%outcome, "scheduler tick finished");
                    }
                }
            }
            info!("auto-update scheduler stopped");
        });

        SchedulerHandle { cancel, join }
    }

    fn initial_delay(&self) -> Duration {
        let interval_ms = i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX);
        let prefs = self.updater.prefs();
        let now = now_millis();
        if prefs.check_is_stale(interval_ms, now) {
            return Duration::ZERO;
        }
        let elapsed = prefs.last_check.map_or(0, |last| now.saturating_sub(last));
        let remaining = interval_ms.saturating_sub(elapsed).max(0);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    /// Run one check/download/apply cycle and record it.
    pub async fn tick(&self) -> TickOutcome {
        let started_at = now_millis();
        let (outcome, package, summary) = self.drive().await;
        let record = TickRecord {
            started_at,
            finished_at: now_millis(),
            outcome,
            version: package.map(|p| p.version),
            summary,
        };
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        outcome
    }

    async fn drive(&self) -> (TickOutcome, Option<UpdatePackage>, String) {
        let package = match self.updater.check(true).await {
            Ok(Some(package)) => package,
            Ok(None) => {
                return (TickOutcome::NothingPending, None, "no update".to_owned());
            }
            Err(e) => {
                error!(error = %e, "scheduled update check failed");
                return (TickOutcome::CheckFailed, None, e.to_string());
            }
        };

        if !self.updater.auto_update() {
            info!(version = %package.version, "auto-update disabled, leaving update pending");
            return (
                TickOutcome::AutoUpdateDisabled,
                Some(package),
                "auto-update disabled".to_owned(),
            );
        }

        let critical = package.severity.is_critical();
        match self.updater.advance(&package, !critical).await {
            Ok(Advance::Superseded) => (
                TickOutcome::NothingPending,
                Some(package),
                "already handled elsewhere".to_owned(),
            ),
            Ok(Advance::Staged) => {
                warn!(
                    version = %package.version,
                    "critical update downloaded, waiting for confirmation"
                );
                (
                    TickOutcome::AwaitingConfirmation,
                    Some(package),
                    "critical update needs confirmation".to_owned(),
                )
            }
            Ok(Advance::Installed) => {
                let summary = format!("installed {}", package.version);
                (TickOutcome::Installed, Some(package), summary)
            }
            Err(e @ TetherError::Transport(_)) => {
                error!(version = %package.version, error = %e, "scheduled download failed");
                let summary = e.to_string();
                (TickOutcome::DownloadFailed, Some(package), summary)
            }
            Err(e) => {
                error!(version = %package.version, error = %e, "scheduled install failed");
                let outcome = if e.triggers_rollback() {
                    TickOutcome::RolledBack
                } else {
                    TickOutcome::ApplyFailed
                };
                (outcome, Some(package), e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for AutoUpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoUpdateScheduler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }
}
