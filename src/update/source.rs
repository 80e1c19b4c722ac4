//! Release feeds and payload transports.
//!
//! [`ReleaseSource`] answers "what is the newest release for this platform",
//! [`PackageTransport`] fetches the bytes behind a package. Both are traits so
//! an HTTP(S) client can replace the bundled feeds without touching the
//! updater.

use crate::error::{Result, TetherError};
use crate::update::package::{TargetPlatform, UpdatePackage};
use crate::version::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Default transfer chunk size in bytes.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Receives the size of each chunk as it arrives.
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(u64) + Send);

/// Remote release descriptor lookup.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Newest release published for `platform`, if any.
    async fn latest(&self, platform: TargetPlatform) -> Result<Option<UpdatePackage>>;
}

/// Payload download.
#[async_trait]
pub trait PackageTransport: Send + Sync {
    /// Fetch the payload of `package`, calling `on_chunk` with the size of
    /// every chunk received. Failures are reported as [`TetherError::Transport`].
    async fn fetch(&self, package: &UpdatePackage, on_chunk: ChunkCallback<'_>) -> Result<Vec<u8>>;
}

/// Newest package for `platform` among `packages`.
fn newest_for<'a, I>(packages: I, platform: TargetPlatform) -> Option<&'a UpdatePackage>
where
    I: IntoIterator<Item = &'a UpdatePackage>,
{
    packages
        .into_iter()
        .filter(|p| p.target_platform == platform)
        .filter_map(|p| p.version.parse::<Version>().ok().map(|v| (v, p)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, p)| p)
}

/// In-process release feed.
///
/// Packages and their payloads are published directly. Failure hooks make
/// the next lookups or downloads fail deterministically.
#[derive(Debug)]
pub struct InMemoryFeed {
    packages: Mutex<Vec<UpdatePackage>>,
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    fail_checks: AtomicUsize,
    fail_downloads: AtomicUsize,
    chunk_size: usize,
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self {
            packages: Mutex::new(Vec::new()),
            payloads: Mutex::new(HashMap::new()),
            fail_checks: AtomicUsize::new(0),
            fail_downloads: AtomicUsize::new(0),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Publish `package` served with `payload`. Replaces any package with the
    /// same version and platform.
    pub fn publish(&self, package: UpdatePackage, payload: Vec<u8>) {
        info!(version = %package.version, platform = %package.target_platform, "feed: release published");
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(package.id.clone(), payload);
        let mut packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        packages.retain(|p| {
            !(p.version == package.version && p.target_platform == package.target_platform)
        });
        packages.push(package);
    }

    /// Remove every published release.
    pub fn withdraw_all(&self) {
        self.packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Make the next `n` lookups fail with a transport error.
    pub fn fail_next_checks(&self, n: usize) {
        self.fail_checks.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` downloads fail with a transport error.
    pub fn fail_next_downloads(&self, n: usize) {
        self.fail_downloads.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReleaseSource for InMemoryFeed {
    async fn latest(&self, platform: TargetPlatform) -> Result<Option<UpdatePackage>> {
        if Self::take_failure(&self.fail_checks) {
            warn!("feed: injected lookup failure");
            return Err(TetherError::Transport("release feed unreachable".to_owned()));
        }
        let packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        Ok(newest_for(packages.iter(), platform).cloned())
    }
}

#[async_trait]
impl PackageTransport for InMemoryFeed {
    async fn fetch(&self, package: &UpdatePackage, on_chunk: ChunkCallback<'_>) -> Result<Vec<u8>> {
        if Self::take_failure(&self.fail_downloads) {
            warn!(version = %package.version, "feed: injected download failure");
            return Err(TetherError::Transport(format!(
                "connection reset while downloading {}",
                package.download_location
            )));
        }

        let payload = self
            .payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&package.id)
            .cloned()
            .ok_or_else(|| {
                TetherError::Transport(format!("{} not found", package.download_location))
            })?;

        let mut received = Vec::with_capacity(payload.len());
        for chunk in payload.chunks(self.chunk_size) {
            received.extend_from_slice(chunk);
            on_chunk(chunk.len() as u64);
            tokio::task::yield_now().await;
        }
        debug!(bytes = received.len(), "feed: payload served");
        Ok(received)
    }
}

/// On-disk release manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseManifest {
    pub packages: Vec<UpdatePackage>,
}

/// Release feed backed by a JSON manifest and payload files next to it.
///
/// `download_location` may be a `file://` URI, an absolute path, or a path
/// relative to the manifest's directory.
#[derive(Debug, Clone)]
pub struct FileFeed {
    manifest_path: PathBuf,
    chunk_size: usize,
}

impl FileFeed {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    async fn read_manifest(&self) -> Result<ReleaseManifest> {
        let bytes = match tokio::fs::read(&self.manifest_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.manifest_path.display(), "feed: no manifest");
                return Ok(ReleaseManifest::default());
            }
            Err(e) => {
                return Err(TetherError::Transport(format!(
                    "cannot read manifest {}: {e}",
                    self.manifest_path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            TetherError::Transport(format!(
                "invalid manifest {}: {e}",
                self.manifest_path.display()
            ))
        })
    }

    fn payload_path(&self, location: &str) -> PathBuf {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);
        if path.is_absolute() {
            return path.to_owned();
        }
        self.manifest_path
            .parent()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|| path.to_owned())
    }
}

#[async_trait]
impl ReleaseSource for FileFeed {
    async fn latest(&self, platform: TargetPlatform) -> Result<Option<UpdatePackage>> {
        let manifest = self.read_manifest().await?;
        Ok(newest_for(manifest.packages.iter(), platform).cloned())
    }
}

#[async_trait]
impl PackageTransport for FileFeed {
    async fn fetch(&self, package: &UpdatePackage, on_chunk: ChunkCallback<'_>) -> Result<Vec<u8>> {
        let path = self.payload_path(&package.download_location);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            TetherError::Transport(format!("cannot open payload {}: {e}", path.display()))
        })?;

        let mut received = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                TetherError::Transport(format!("cannot read payload {}: {e}", path.display()))
            })?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            on_chunk(n as u64);
        }
        info!(path = %path.display(), bytes = received.len(), "feed: payload read");
        Ok(received)
    }
}
