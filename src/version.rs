//! Total order over release version strings.
//!
//! Accepted forms are `MAJOR[.MINOR[.PATCH[.REVISION]]][-PRE]` with an
//! optional leading `v`. Missing numeric components are zero, so `11`,
//! `11.0` and `11.0.0.0` are all equal.
//!
//! Ordering compares the four numeric components left to right. A version
//! with a pre-release tag sorts *before* the same numbers without one
//! (`11.1.0-rc.1 < 11.1.0`). Pre-release tags are compared dot-separated
//! identifier by identifier: numeric identifiers compare numerically and rank
//! below alphanumeric ones, and a shorter tag that is a prefix of a longer one
//! sorts first. Numeric identifiers with leading zeros (`rc.01`) are rejected.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed, totally ordered release version.
#[derive(Debug, Clone, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Optional fourth numeric component (hotfix revision).
    pub revision: u64,
    /// Pre-release identifiers, e.g. `["rc", "1"]` for `-rc.1`.
    pub pre: Vec<String>,
}

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(pub String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version: {:?}", self.0)
    }
}

impl std::error::Error for VersionParseError {}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            revision: 0,
            pre: Vec::new(),
        }
    }

    /// Returns `true` when this is a pre-release build.
    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    /// Returns `true` if `candidate` parses and is strictly newer than `current`.
    ///
    /// Unparsable strings are never considered an update.
    pub fn is_newer(candidate: &str, current: &str) -> bool {
        match (candidate.parse::<Version>(), current.parse::<Version>()) {
            (Ok(candidate), Ok(current)) => candidate > current,
            _ => false,
        }
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(VersionParseError(s.to_owned()));
        }

        let (numbers, pre) = match body.split_once('-') {
            Some((numbers, pre)) => (numbers, Some(pre)),
            None => (body, None),
        };

        let mut parts = [0u64; 4];
        let mut count = 0;
        for piece in numbers.split('.') {
            if count == parts.len() || piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(VersionParseError(s.to_owned()));
            }
            parts[count] = piece
                .parse()
                .map_err(|_| VersionParseError(s.to_owned()))?;
            count += 1;
        }

        let pre = match pre {
            Some(tag) => {
                let ids: Vec<String> = tag.split('.').map(str::to_owned).collect();
                // Numeric identifiers must be canonical so equal versions hash alike.
                let valid = ids.iter().all(|id| {
                    let numeric = id.bytes().all(|b| b.is_ascii_digit());
                    !id.is_empty()
                        && id.bytes().all(|b| b.is_ascii_alphanumeric())
                        && !(numeric && id.len() > 1 && id.starts_with('0'))
                });
                if !valid {
                    return Err(VersionParseError(s.to_owned()));
                }
                ids
            }
            None => Vec::new(),
        };

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            revision: parts[3],
            pre,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.revision > 0 {
            write!(f, ".{}", self.revision)?;
        }
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre.join("."))?;
        }
        Ok(())
    }
}

fn cmp_identifier(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let numeric = (self.major, self.minor, self.patch, self.revision).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.revision,
        ));
        if numeric != Ordering::Equal {
            return numeric;
        }

        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                for (a, b) in self.pre.iter().zip(other.pre.iter()) {
                    let ord = cmp_identifier(a, b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.pre.len().cmp(&other.pre.len())
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
