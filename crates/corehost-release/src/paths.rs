//! Storage keys for every record corehost persists.
//!
//! Keys that hold ULID-named records sort by creation time under their prefix.

use corehost_core::{HistoryEntryId, InstanceId, JobId, VersionId};

/// The version registry document.
pub const MANIFEST: &str = "manifests.json";

/// Lease that serializes deployments.
pub const DEPLOY_LOCK: &str = "locks/deploy.lock.json";

/// Prefix for deployment job records.
pub const JOBS_PREFIX: &str = "deployments/";

/// Prefix for instance records.
pub const INSTANCES_PREFIX: &str = "directory/instances/";

/// Prefix for instance user records.
pub const USERS_PREFIX: &str = "directory/users/";

/// Deployment job record.
#[must_use]
pub fn job(id: &JobId) -> String {
    format!("{JOBS_PREFIX}job={id}.json")
}

/// Content manifest of one materialized version.
#[must_use]
pub fn content_manifest(version: &VersionId) -> String {
    let (major, minor, patch) = version.triple();
    format!("content/{major}.{minor}.{patch}.json")
}

/// History entries for one instance.
#[must_use]
pub fn history_prefix(instance: InstanceId) -> String {
    format!("history/instance={instance}/")
}

/// One history entry.
#[must_use]
pub fn history_entry(instance: InstanceId, id: &HistoryEntryId) -> String {
    format!("{}{id}.json", history_prefix(instance))
}

/// Lease serializing version changes on one instance.
#[must_use]
pub fn instance_lock(instance: InstanceId) -> String {
    format!("locks/instance={instance}.lock.json")
}

/// Lease shared by everything that changes whether a version may be used.
///
/// Keyed by the numeric triple so `v1.2.3` and `1.2.3` contend for the same record.
#[must_use]
pub fn version_lock(version: &VersionId) -> String {
    let (major, minor, patch) = version.triple();
    format!("locks/version={major}.{minor}.{patch}.lock.json")
}

/// Instance record.
#[must_use]
pub fn instance(instance: InstanceId) -> String {
    format!("{INSTANCES_PREFIX}{instance}.json")
}

/// Instance user record.
#[must_use]
pub fn user(user_id: u64) -> String {
    format!("{USERS_PREFIX}{user_id}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_key_ignores_prefix_spelling() {
        let a: VersionId = "v1.2.3".parse().unwrap();
        let b: VersionId = "1.2.3".parse().unwrap();
        assert_eq!(content_manifest(&a), content_manifest(&b));
    }

    #[test]
    fn version_lock_ignores_prefix_spelling() {
        let a: VersionId = "v1.2.3".parse().unwrap();
        let b: VersionId = "1.2.3".parse().unwrap();
        assert_eq!(version_lock(&a), version_lock(&b));
        assert_ne!(version_lock(&a), DEPLOY_LOCK);
    }

    #[test]
    fn history_entries_live_under_their_instance() {
        let id = HistoryEntryId::generate();
        let key = history_entry(InstanceId::new(7), &id);
        assert!(key.starts_with(&history_prefix(InstanceId::new(7))));
        assert!(!key.starts_with(&history_prefix(InstanceId::new(70))));
    }
}
