//! The version registry document and its invariants.
//!
//! A [`Manifest`] lists every known core version, names exactly one of them
//! `latest`, and remembers the last deployment. The same shape is served by
//! the upstream authority and persisted locally.
//!
//! Every mutation here is pure: callers load, mutate, validate, and write
//! back through [`crate::store::ManifestStore::update`].

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use corehost_core::VersionId;

use crate::error::{ReleaseError, Result};

/// Lifecycle status of a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// The version new instances should run.
    Latest,
    /// Any other deployed version.
    Stable,
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Size and usage figures for one version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionStats {
    /// Instances pinned to this version.
    pub instances_using: u64,
    /// Files in the version's tree.
    pub file_count: u64,
    /// Total bytes in the version's tree.
    pub size: u64,
}

/// One version in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    /// Version identifier, also the name of its directory.
    pub version: VersionId,
    /// Release notes.
    #[serde(default)]
    pub description: String,
    /// Whether this is the latest version.
    pub status: VersionStatus,
    /// When the version was released.
    #[serde(deserialize_with = "release_date")]
    pub release_date: DateTime<Utc>,
    /// Size and usage figures.
    #[serde(default)]
    pub stats: VersionStats,
}

/// The most recent successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDeployed {
    /// The version that was deployed.
    pub version: VersionId,
    /// When its registry entry was written.
    pub deployed_at: DateTime<Utc>,
    /// Fingerprint of the source tree it was materialized from.
    pub source_fingerprint: String,
}

/// The version registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Identifier of the version whose status is `latest`.
    pub latest: VersionId,
    /// Known versions, newest first.
    pub versions: Vec<VersionEntry>,
    /// The most recent successful deployment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<LastDeployed>,
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates.
fn release_date<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid releaseDate '{raw}'")))
}

impl VersionEntry {
    /// Creates an entry released now.
    #[must_use]
    pub fn new(version: VersionId, description: impl Into<String>, status: VersionStatus) -> Self {
        Self {
            version,
            description: description.into(),
            status,
            release_date: Utc::now(),
            stats: VersionStats::default(),
        }
    }
}

impl Manifest {
    /// Creates a registry holding a single latest version.
    #[must_use]
    pub fn seed(version: VersionId, description: impl Into<String>, stats: VersionStats) -> Self {
        let mut entry = VersionEntry::new(version.clone(), description, VersionStatus::Latest);
        entry.stats = stats;
        Self {
            latest: version,
            versions: vec![entry],
            last_deployed: None,
        }
    }

    /// Parses and validates a registry document received from upstream.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::MalformedResponse`] if the payload does not
    /// parse or breaks an invariant.
    pub fn from_remote_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| ReleaseError::malformed(format!("manifest does not parse: {e}")))?;
        manifest
            .validate()
            .map_err(|e| ReleaseError::malformed(e.to_string()))?;
        Ok(manifest)
    }

    /// Checks the registry invariants.
    ///
    /// Identifiers are unique, exactly one entry is `latest`, and the
    /// top-level `latest` names that entry.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.versions {
            if !seen.insert(entry.version.triple()) {
                return Err(ReleaseError::validation(format!(
                    "version {} is listed more than once",
                    entry.version
                )));
            }
        }

        let latest: Vec<&VersionEntry> = self
            .versions
            .iter()
            .filter(|v| v.status == VersionStatus::Latest)
            .collect();
        match latest.as_slice() {
            [only] if only.version == self.latest => Ok(()),
            [only] => Err(ReleaseError::validation(format!(
                "latest is {} but {} has status latest",
                self.latest, only.version
            ))),
            [] => Err(ReleaseError::validation("no version has status latest")),
            _ => Err(ReleaseError::validation(
                "more than one version has status latest",
            )),
        }
    }

    /// Looks up a version by identifier, ignoring prefix spelling.
    #[must_use]
    pub fn find(&self, version: &VersionId) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| &v.version == version)
    }

    /// Returns true if the version is registered.
    #[must_use]
    pub fn contains(&self, version: &VersionId) -> bool {
        self.find(version).is_some()
    }

    /// Makes `version` the latest, demoting the previous latest to stable.
    ///
    /// Returns `false` without changes when it already is the latest.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the version is not registered.
    pub fn mark_latest(&mut self, version: &VersionId) -> Result<bool> {
        let Some(index) = self.versions.iter().position(|v| &v.version == version) else {
            return Err(ReleaseError::not_found("version", version));
        };
        if self.versions[index].status == VersionStatus::Latest && self.latest == *version {
            return Ok(false);
        }

        for entry in &mut self.versions {
            if entry.status == VersionStatus::Latest {
                entry.status = VersionStatus::Stable;
            }
        }
        let entry = &mut self.versions[index];
        entry.status = VersionStatus::Latest;
        self.latest = entry.version.clone();
        Ok(true)
    }

    /// Prepends a newly deployed version as the latest.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] if the version already exists.
    pub fn insert_latest(&mut self, mut entry: VersionEntry) -> Result<()> {
        if self.contains(&entry.version) {
            return Err(ReleaseError::validation(format!(
                "version {} already exists",
                entry.version
            )));
        }
        for existing in &mut self.versions {
            if existing.status == VersionStatus::Latest {
                existing.status = VersionStatus::Stable;
            }
        }
        entry.status = VersionStatus::Latest;
        self.latest = entry.version.clone();
        self.versions.insert(0, entry);
        Ok(())
    }

    /// Removes a version that is not the latest.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if absent, or
    /// [`ReleaseError::InvalidOperation`] if it is the latest.
    pub fn remove(&mut self, version: &VersionId) -> Result<VersionEntry> {
        let Some(index) = self.versions.iter().position(|v| &v.version == version) else {
            return Err(ReleaseError::not_found("version", version));
        };
        if self.latest == *version || self.versions[index].status == VersionStatus::Latest {
            return Err(ReleaseError::invalid_operation(
                "cannot delete the latest version; mark another version latest first",
            ));
        }
        Ok(self.versions.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionId {
        s.parse().unwrap()
    }

    fn three_versions() -> Manifest {
        let mut m = Manifest::seed(v("v1.0.0"), "Initial release", VersionStats::default());
        m.insert_latest(VersionEntry::new(v("v1.1.0"), "features", VersionStatus::Stable))
            .unwrap();
        m.insert_latest(VersionEntry::new(v("v1.2.0"), "bugfixes", VersionStatus::Stable))
            .unwrap();
        m
    }

    fn assert_single_latest(m: &Manifest) {
        m.validate().unwrap();
        let latest: Vec<_> = m
            .versions
            .iter()
            .filter(|e| e.status == VersionStatus::Latest)
            .collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, m.latest);
    }

    #[test]
    fn insert_latest_demotes_previous() {
        let m = three_versions();
        assert_single_latest(&m);
        assert_eq!(m.latest, v("v1.2.0"));
        assert_eq!(m.versions[0].version, v("v1.2.0"));
        assert_eq!(m.find(&v("v1.1.0")).unwrap().status, VersionStatus::Stable);
    }

    #[test]
    fn insert_rejects_duplicates_across_prefix_spelling() {
        let mut m = three_versions();
        let err = m
            .insert_latest(VersionEntry::new(v("1.1.0"), "", VersionStatus::Latest))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Validation { .. }));
    }

    #[test]
    fn mark_latest_keeps_single_latest() {
        let mut m = three_versions();
        assert!(m.mark_latest(&v("v1.0.0")).unwrap());
        assert_single_latest(&m);
        assert_eq!(m.latest, v("v1.0.0"));
        assert_eq!(m.find(&v("v1.2.0")).unwrap().status, VersionStatus::Stable);
        assert_eq!(m.find(&v("v1.1.0")).unwrap().status, VersionStatus::Stable);
    }

    #[test]
    fn mark_latest_on_current_latest_is_noop() {
        let mut m = three_versions();
        assert!(!m.mark_latest(&v("v1.2.0")).unwrap());
        assert_single_latest(&m);
    }

    #[test]
    fn mark_latest_unknown_version_is_not_found() {
        let mut m = three_versions();
        let err = m.mark_latest(&v("v9.0.0")).unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
    }

    #[test]
    fn remove_refuses_latest() {
        let mut m = three_versions();
        let err = m.remove(&v("v1.2.0")).unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidOperation { .. }));
        assert!(m.remove(&v("v1.1.0")).is_ok());
        assert!(!m.contains(&v("v1.1.0")));
    }

    #[test]
    fn validate_catches_mismatched_latest_field() {
        let mut m = three_versions();
        m.latest = v("v1.0.0");
        assert!(m.validate().is_err());
    }

    #[test]
    fn remote_payload_accepts_date_only_release_dates() {
        let body = br#"{
            "latest": "v1.1.0",
            "versions": [
                {"version": "v1.1.0", "description": "b", "status": "latest", "releaseDate": "2024-03-01"},
                {"version": "v1.0.0", "description": "a", "status": "stable", "releaseDate": "2024-01-15T10:00:00Z",
                 "stats": {"instancesUsing": 2, "fileCount": 3, "size": 1024}}
            ]
        }"#;
        let m = Manifest::from_remote_bytes(body).unwrap();
        assert_eq!(m.latest, v("v1.1.0"));
        assert_eq!(m.versions[1].stats.file_count, 3);
    }

    #[test]
    fn remote_payload_with_two_latest_is_malformed() {
        let body = br#"{
            "latest": "v1.1.0",
            "versions": [
                {"version": "v1.1.0", "status": "latest", "releaseDate": "2024-03-01"},
                {"version": "v1.0.0", "status": "latest", "releaseDate": "2024-01-15"}
            ]
        }"#;
        let err = Manifest::from_remote_bytes(body).unwrap_err();
        assert!(matches!(err, ReleaseError::MalformedResponse { .. }));
        let err = Manifest::from_remote_bytes(b"<html>").unwrap_err();
        assert!(matches!(err, ReleaseError::MalformedResponse { .. }));
    }
}
