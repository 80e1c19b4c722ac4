//! Installation step: putting verified package artifacts in place.

use crate::error::{Result, TetherError};
use crate::update::package::UpdatePackage;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the marker file recording the installed version.
pub const CURRENT_MARKER: &str = "current";

/// Writes the artifacts of a verified package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Returns [`TetherError::Install`] when the artifacts could not be written.
    async fn install(&self, package: &UpdatePackage, payload: &[u8]) -> Result<()>;
}

/// Installer that only records the install in the log.
///
/// Used when the host has no artifact directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstaller;

#[async_trait]
impl PackageInstaller for NoopInstaller {
    async fn install(&self, package: &UpdatePackage, payload: &[u8]) -> Result<()> {
        info!(version = %package.version, bytes = payload.len(), "installer: nothing to write");
        Ok(())
    }
}

/// Writes each payload to `<dir>/<version>.pak` and points the `current`
/// marker at it.
///
/// The marker is replaced with a rename so readers never see a partial
/// value. A failed marker swap removes the freshly written payload.
#[derive(Debug, Clone)]
pub struct ArtifactInstaller {
    dir: PathBuf,
}

impl ArtifactInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact written for `version`.
    pub fn artifact_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{version}.pak"))
    }

    /// Version named by the `current` marker, if any.
    pub async fn installed_version(&self) -> Option<String> {
        tokio::fs::read_to_string(self.dir.join(CURRENT_MARKER))
            .await
            .ok()
            .map(|s| s.trim().to_owned())
    }
}

fn install_error(action: &str, path: &Path, e: std::io::Error) -> TetherError {
    TetherError::Install(format!("cannot {action} {}: {e}", path.display()))
}

#[async_trait]
impl PackageInstaller for ArtifactInstaller {
    async fn install(&self, package: &UpdatePackage, payload: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| install_error("create", &self.dir, e))?;

        let artifact = self.artifact_path(&package.version);
        tokio::fs::write(&artifact, payload)
            .await
            .map_err(|e| install_error("write", &artifact, e))?;

        let marker = self.dir.join(CURRENT_MARKER);
        let staged = marker.with_extension("new");
        let swapped = match tokio::fs::write(&staged, package.version.as_bytes()).await {
            Ok(()) => tokio::fs::rename(&staged, &marker).await,
            Err(e) => Err(e),
        };
        if let Err(e) = swapped {
            let _ = tokio::fs::remove_file(&staged).await;
            let _ = tokio::fs::remove_file(&artifact).await;
            return Err(install_error("update marker", &marker, e));
        }

        info!(
            version = %package.version,
            path = %artifact.display(),
            "installer: artifacts written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::package::{Severity, TargetPlatform};

    fn pkg(version: &str, payload: &[u8]) -> UpdatePackage {
        UpdatePackage::for_payload(version, Severity::Feature, TargetPlatform::Linux, payload)
    }

    #[tokio::test]
    async fn writes_payload_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let installer = ArtifactInstaller::new(dir.path().join("artifacts"));

        installer.install(&pkg("11.1.0", b"one"), b"one").await.unwrap();
        installer.install(&pkg("11.2.0", b"two"), b"two").await.unwrap();

        assert_eq!(installer.installed_version().await.as_deref(), Some("11.2.0"));
        assert_eq!(std::fs::read(installer.artifact_path("11.1.0")).unwrap(), b"one");
        assert_eq!(std::fs::read(installer.artifact_path("11.2.0")).unwrap(), b"two");
        assert!(!installer.dir().join("current.new").exists());
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_install_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a dir").unwrap();
        let installer = ArtifactInstaller::new(blocker.join("artifacts"));

        let err = installer.install(&pkg("11.1.0", b"x"), b"x").await.unwrap_err();
        assert!(matches!(err, TetherError::Install(_)));
        assert!(err.triggers_rollback());
    }

    #[tokio::test]
    async fn noop_installer_succeeds() {
        assert!(NoopInstaller.install(&pkg("11.1.0", b"x"), b"x").await.is_ok());
    }
}
