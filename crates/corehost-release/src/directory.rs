//! The instance directory: which instances exist, which version each runs,
//! and which users may administer them.
//!
//! Client and instance provisioning happen elsewhere. This module only needs
//! lookups, the `coreVersion` pointer, and role checks, so the contract is
//! kept narrow.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use corehost_core::{InstanceId, StorageBackend, VersionId, WritePrecondition, WriteResult};

use crate::error::{ReleaseError, Result};
use crate::paths;

/// A hosted tenant deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance identifier.
    pub id: InstanceId,
    /// Owning client, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    /// Subdomain the instance is served on.
    pub subdomain: String,
    /// The core version the instance runs.
    pub core_version: VersionId,
}

/// Role of a user within one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// May change the instance's version.
    Admin,
    /// Regular user.
    Member,
}

/// A user scoped to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUser {
    /// User identifier.
    pub id: u64,
    /// The instance this user belongs to.
    pub instance_id: InstanceId,
    /// Login email.
    pub email: String,
    /// Role within the instance.
    pub role: InstanceRole,
}

impl InstanceUser {
    /// True if this user administers `instance`.
    #[must_use]
    pub fn is_admin_of(&self, instance: InstanceId) -> bool {
        self.instance_id == instance && self.role == InstanceRole::Admin
    }
}

/// Initial directory content imported at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectorySeed {
    /// Instances to create or overwrite.
    pub instances: Vec<Instance>,
    /// Users to create or overwrite.
    pub users: Vec<InstanceUser>,
}

/// Lookups and mutations the version lifecycle needs from the directory.
#[async_trait]
pub trait InstanceDirectory: Send + Sync + 'static {
    /// Fetches an instance.
    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>>;

    /// Lists every instance.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Points an instance at `version` and returns the updated record.
    ///
    /// Fails with [`ReleaseError::NotFound`] if the instance does not exist.
    async fn set_core_version(&self, id: InstanceId, version: &VersionId) -> Result<Instance>;

    /// Fetches an instance user.
    async fn find_user(&self, user_id: u64) -> Result<Option<InstanceUser>>;

    /// Creates or replaces an instance.
    async fn upsert_instance(&self, instance: &Instance) -> Result<()>;

    /// Creates or replaces an instance user.
    async fn upsert_user(&self, user: &InstanceUser) -> Result<()>;

    /// Counts instances running `version`.
    async fn count_instances_on(&self, version: &VersionId) -> Result<u64> {
        let instances = self.list_instances().await?;
        Ok(instances.iter().filter(|i| i.core_version == *version).count() as u64)
    }
}

/// Imports `seed` into `directory`, overwriting records with the same IDs.
///
/// # Errors
///
/// Returns [`ReleaseError::Validation`] if a user references an instance
/// that is neither in the seed nor already in the directory.
pub async fn import_seed(directory: &dyn InstanceDirectory, seed: &DirectorySeed) -> Result<()> {
    for instance in &seed.instances {
        directory.upsert_instance(instance).await?;
    }
    for user in &seed.users {
        if directory.get_instance(user.instance_id).await?.is_none() {
            return Err(ReleaseError::validation(format!(
                "user {} references unknown instance {}",
                user.id, user.instance_id
            )));
        }
        directory.upsert_user(user).await?;
    }
    tracing::info!(
        instances = seed.instances.len(),
        users = seed.users.len(),
        "imported directory seed"
    );
    Ok(())
}

/// Directory records kept on the storage backend as JSON documents.
#[derive(Clone)]
pub struct StorageInstanceDirectory {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageInstanceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageInstanceDirectory").finish_non_exhaustive()
    }
}

impl StorageInstanceDirectory {
    /// Creates a directory over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get(key).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        self.storage.put(key, bytes, WritePrecondition::None).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceDirectory for StorageInstanceDirectory {
    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        self.read(&paths::instance(id)).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut metas = self.storage.list(paths::INSTANCES_PREFIX).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        let mut instances = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(instance) = self.read::<Instance>(&meta.path).await? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    async fn set_core_version(&self, id: InstanceId, version: &VersionId) -> Result<Instance> {
        let key = paths::instance(id);
        let Some(meta) = self.storage.head(&key).await? else {
            return Err(ReleaseError::not_found("instance", id));
        };
        let Some(mut instance) = self.read::<Instance>(&key).await? else {
            return Err(ReleaseError::not_found("instance", id));
        };
        instance.core_version = version.clone();

        let bytes = Bytes::from(serde_json::to_vec(&instance)?);
        match self
            .storage
            .put(&key, bytes, WritePrecondition::MatchesVersion(meta.version))
            .await?
        {
            WriteResult::Success { .. } => Ok(instance),
            WriteResult::PreconditionFailed { .. } => Err(ReleaseError::conflict(format!(
                "instance {id} was modified concurrently"
            ))),
        }
    }

    async fn find_user(&self, user_id: u64) -> Result<Option<InstanceUser>> {
        self.read(&paths::user(user_id)).await
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<()> {
        self.write(&paths::instance(instance.id), instance).await
    }

    async fn upsert_user(&self, user: &InstanceUser) -> Result<()> {
        self.write(&paths::user(user.id), user).await
    }
}
