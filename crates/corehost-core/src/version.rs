//! Core software version identifiers.
//!
//! A version identifier is `MAJOR.MINOR.PATCH`, optionally prefixed with `v`
//! (`v1.2.0` and `1.2.0` name the same release). The spelling a version was
//! deployed under is kept for display and for its directory name, while
//! equality and ordering use the numeric triple.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A parsed `v?MAJOR.MINOR.PATCH` identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VersionId {
    raw: String,
    major: u64,
    minor: u64,
    patch: u64,
}

impl VersionId {
    /// Returns the identifier as it was written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the `(major, minor, patch)` triple.
    #[must_use]
    pub const fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

fn component(part: &str, input: &str) -> Result<u64, Error> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidInput(format!(
            "invalid version '{input}': expected MAJOR.MINOR.PATCH"
        )));
    }
    part.parse::<u64>().map_err(|_| {
        Error::InvalidInput(format!("invalid version '{input}': component out of range"))
    })
}

impl FromStr for VersionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix('v').unwrap_or(s);
        let mut parts = body.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidInput(format!(
                "invalid version '{s}': expected MAJOR.MINOR.PATCH"
            )));
        };
        Ok(Self {
            raw: s.to_string(),
            major: component(major, s)?,
            minor: component(minor, s)?,
            patch: component(patch, s)?,
        })
    }
}

impl TryFrom<String> for VersionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.raw
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for VersionId {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for VersionId {}

impl Hash for VersionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl PartialOrd for VersionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_optional_and_preserved() {
        let plain: VersionId = "1.2.0".parse().unwrap();
        let prefixed: VersionId = "v1.2.0".parse().unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.to_string(), "1.2.0");
        assert_eq!(prefixed.to_string(), "v1.2.0");
    }

    #[test]
    fn malformed_versions_are_rejected() {
        for bad in ["", "v", "1.2", "1.2.3.4", "1..3", "v1.2.x", "../1.0.0", "1.0.0/", " 1.0.0"] {
            assert!(bad.parse::<VersionId>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn ordering_is_numeric() {
        let a: VersionId = "v1.9.0".parse().unwrap();
        let b: VersionId = "v1.10.0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn serde_uses_written_form() {
        let v: VersionId = serde_json::from_str("\"v2.0.1\"").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"v2.0.1\"");
        assert!(serde_json::from_str::<VersionId>("\"two\"").is_err());
    }
}
