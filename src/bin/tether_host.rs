//! Headless host for one tether instance.
//!
//! Loads configuration (path from the first argument, otherwise the default
//! config path), starts the auto-update scheduler and logs every sync and
//! updater event until Ctrl+C.
//!
//! All tracing output goes to stderr.

use anyhow::Context;
use std::path::PathBuf;
use tether::sync::SyncHub;
use tether::{Instance, TetherConfig, UpdaterEvent};
use tokio::sync::broadcast::error::RecvError;

fn load_config() -> anyhow::Result<TetherConfig> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(TetherConfig::default_config_path);

    if !path.exists() && explicit.is_none() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(TetherConfig::default());
    }
    TetherConfig::from_file(&path).with_context(|| format!("cannot load {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let hub = SyncHub::new(config.sync.channel_capacity);
    let instance = Instance::builder(config, &hub)
        .build()
        .context("cannot start instance")?;

    tracing::info!(
        instance = %instance.instance_id(),
        version = %instance.current_version(),
        "tether-host starting"
    );

    instance.bus().subscribe(|event| {
        tracing::info!(
            kind = %event.kind,
            source = %event.source_instance_id,
            entity = event.entity_id.as_deref().unwrap_or(""),
            "sync event"
        );
    });

    let mut updates = instance.updater().subscribe();
    let update_log = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(UpdaterEvent::DownloadProgress(progress)) => {
                    tracing::debug!(percent = progress.percent, "download progress");
                }
                Ok(event) => tracing::info!(?event, "updater event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "updater events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let scheduler = instance.start_scheduler();

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl+C")?;
    tracing::info!("shutdown requested");

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    instance.leave();
    update_log.abort();

    tracing::info!("tether-host shut down cleanly");
    Ok(())
}
