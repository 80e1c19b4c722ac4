//! Package payload integrity verification.
//!
//! Packages advertise an integrity digest of the form `sha256-<hex>` (a bare
//! 64-character hex string is accepted too). The downloaded payload is hashed
//! and compared before anything is installed.
//!
//! # Example
//!
//! ```rust
//! use tether::integrity::{digest_of, verify, IntegrityResult};
//!
//! let payload = b"package bytes";
//! let digest = digest_of(payload);
//! assert!(digest.starts_with("sha256-"));
//! assert_eq!(verify(payload, &digest), IntegrityResult::Ok);
//! assert_eq!(verify(b"tampered", &digest), IntegrityResult::Mismatch);
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{info, warn};

const SHA256_PREFIX: &str = "sha256-";

/// Result of a payload integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityResult {
    /// Payload digest matches.
    Ok,
    /// Payload digest differs from the advertised one.
    Mismatch,
    /// The advertised digest is not in a recognised format.
    Malformed,
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

/// Digest string for `bytes` in the advertised `sha256-<hex>` form.
pub fn digest_of(bytes: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", sha256_hex(bytes))
}

/// Extract the hex part of an advertised digest, if well-formed.
fn expected_hex(advertised: &str) -> Option<&str> {
    let hex = advertised
        .strip_prefix(SHA256_PREFIX)
        .unwrap_or(advertised);
    let well_formed = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
    well_formed.then_some(hex)
}

/// Verify `payload` against an advertised digest.
pub fn verify(payload: &[u8], advertised: &str) -> IntegrityResult {
    let Some(expected) = expected_hex(advertised) else {
        warn!(advertised, "integrity: digest is malformed");
        return IntegrityResult::Malformed;
    };

    let actual = sha256_hex(payload);
    if actual.eq_ignore_ascii_case(expected) {
        info!(bytes = payload.len(), "integrity: digest ok");
        IntegrityResult::Ok
    } else {
        warn!(
            expected,
            actual = %actual,
            "integrity: digest mismatch"
        );
        IntegrityResult::Mismatch
    }
}
