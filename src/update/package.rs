//! Release descriptors.

use crate::integrity::digest_of;
use crate::notify::Channel;
use crate::state::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How urgent a release is. Drives whether installation needs explicit
/// confirmation; the updater itself ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Feature,
    Maintenance,
    /// Security fix. Announced loudly, downloaded eagerly, never auto-installed.
    Critical,
}

impl Severity {
    pub fn is_critical(self) -> bool {
        self == Self::Critical
    }

    /// Channels a discovery of this severity is announced on.
    pub fn announcement_channels(self) -> &'static [Channel] {
        match self {
            Self::Critical => &[Channel::InApp, Channel::OsPush],
            Self::Feature | Self::Maintenance => &[Channel::InApp],
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feature => write!(f, "feature"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Runtime environment a package targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    Web,
    Win32,
    Darwin,
    Linux,
    Android,
    Ios,
}

impl TargetPlatform {
    /// Platform of the running process.
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "windows" => Self::Win32,
            "macos" => Self::Darwin,
            "linux" => Self::Linux,
            "android" => Self::Android,
            "ios" => Self::Ios,
            _ => Self::Web,
        }
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Web => "web",
            Self::Win32 => "win32",
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Android => "android",
            Self::Ios => "ios",
        };
        f.write_str(s)
    }
}

impl FromStr for TargetPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "win32" | "windows" => Ok(Self::Win32),
            "darwin" | "macos" => Ok(Self::Darwin),
            "linux" => Ok(Self::Linux),
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            other => Err(format!("unknown platform: {other:?}")),
        }
    }
}

/// An available release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub id: String,
    pub version: String,
    /// Epoch millis.
    pub release_date: i64,
    pub changelog: Vec<String>,
    pub download_location: String,
    /// `sha256-<hex>` digest of the payload.
    pub integrity_digest: String,
    pub severity: Severity,
    pub size_bytes: u64,
    pub target_platform: TargetPlatform,
}

impl UpdatePackage {
    /// Describe `payload` as release `version`, computing digest and size from it.
    pub fn for_payload(
        version: &str,
        severity: Severity,
        target_platform: TargetPlatform,
        payload: &[u8],
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: version.to_owned(),
            release_date: now_millis(),
            changelog: Vec::new(),
            download_location: format!("mem://{target_platform}/v{version}.pak"),
            integrity_digest: digest_of(payload),
            severity,
            size_bytes: payload.len() as u64,
            target_platform,
        }
    }

    #[must_use]
    pub fn with_changelog<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changelog = entries.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_download_location(mut self, location: impl Into<String>) -> Self {
        self.download_location = location.into();
        self
    }

    /// Human-readable size, e.g. `45.0 MB`.
    pub fn display_size(&self) -> String {
        format!("{:.1} MB", self.size_bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::integrity::{IntegrityResult, verify};

    #[test]
    fn critical_is_announced_on_push_too() {
        assert_eq!(
            Severity::Critical.announcement_channels(),
            &[Channel::InApp, Channel::OsPush]
        );
        assert_eq!(Severity::Feature.announcement_channels(), &[Channel::InApp]);
        assert_eq!(Severity::Maintenance.announcement_channels(), &[Channel::InApp]);
    }

    #[test]
    fn for_payload_describes_the_bytes() {
        let payload = b"release bytes";
        let pkg = UpdatePackage::for_payload("11.1.0", Severity::Feature, TargetPlatform::Linux, payload)
            .with_changelog(["Faster search"]);
        assert_eq!(pkg.size_bytes, payload.len() as u64);
        assert_eq!(verify(payload, &pkg.integrity_digest), IntegrityResult::Ok);
        assert_eq!(pkg.download_location, "mem://linux/v11.1.0.pak");
        assert_eq!(pkg.changelog, vec!["Faster search"]);
    }

    #[test]
    fn platform_parses_aliases() {
        assert_eq!("macos".parse::<TargetPlatform>().unwrap(), TargetPlatform::Darwin);
        assert_eq!("WIN32".parse::<TargetPlatform>().unwrap(), TargetPlatform::Win32);
        assert!("beos".parse::<TargetPlatform>().is_err());
    }

    #[test]
    fn package_json_field_names() {
        let pkg = UpdatePackage::for_payload("1.0.0", Severity::Critical, TargetPlatform::Web, b"x");
        let value = serde_json::to_value(&pkg).unwrap();
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["target_platform"], "web");
    }

    #[test]
    fn display_size_in_megabytes() {
        let mut pkg = UpdatePackage::for_payload("1.0.0", Severity::Feature, TargetPlatform::Web, b"");
        pkg.size_bytes = 45 * 1024 * 1024;
        assert_eq!(pkg.display_size(), "45.0 MB");
    }
}
