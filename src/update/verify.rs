//! Payload verification step of an install.

use crate::error::{Result, TetherError};
use crate::integrity::{self, IntegrityResult};
use crate::update::package::UpdatePackage;
use async_trait::async_trait;

/// Checks a downloaded payload before it is installed.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Returns [`TetherError::Integrity`] when `payload` must not be installed.
    async fn verify(&self, package: &UpdatePackage, payload: &[u8]) -> Result<()>;
}

/// Compares the payload's SHA-256 with the package's advertised digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

#[async_trait]
impl Verifier for DigestVerifier {
    async fn verify(&self, package: &UpdatePackage, payload: &[u8]) -> Result<()> {
        match integrity::verify(payload, &package.integrity_digest) {
            IntegrityResult::Ok => Ok(()),
            IntegrityResult::Mismatch => Err(TetherError::Integrity {
                expected: package.integrity_digest.clone(),
                actual: integrity::digest_of(payload),
            }),
            IntegrityResult::Malformed => Err(TetherError::Integrity {
                expected: package.integrity_digest.clone(),
                actual: "unrecognised digest format".to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::package::{Severity, TargetPlatform};

    #[tokio::test]
    async fn accepts_matching_payload() {
        let pkg = UpdatePackage::for_payload("1.0.1", Severity::Feature, TargetPlatform::Linux, b"ok");
        assert!(DigestVerifier.verify(&pkg, b"ok").await.is_ok());
    }

    #[tokio::test]
    async fn mismatch_reports_both_digests() {
        let pkg = UpdatePackage::for_payload("1.0.1", Severity::Feature, TargetPlatform::Linux, b"ok");
        let err = DigestVerifier.verify(&pkg, b"tampered").await.unwrap_err();
        match err {
            TetherError::Integrity { expected, actual } => {
                assert_eq!(expected, pkg.integrity_digest);
                assert_eq!(actual, integrity::digest_of(b"tampered"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_digest_is_an_integrity_error() {
        let mut pkg = UpdatePackage::for_payload("1.0.1", Severity::Feature, TargetPlatform::Linux, b"ok");
        pkg.integrity_digest = "sha256-mock-hash-integrity-check".to_owned();
        let err = DigestVerifier.verify(&pkg, b"ok").await.unwrap_err();
        assert!(err.triggers_rollback());
    }
}
