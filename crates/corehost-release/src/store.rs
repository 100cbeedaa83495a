//! Persistence for the version registry and per-version content manifests.
//!
//! Reads are lock-free. Writes go through [`ManifestStore::update`], a
//! read-modify-write loop guarded by the storage version token, so two
//! writers can never silently overwrite each other.

use std::sync::Arc;

use bytes::Bytes;

use corehost_core::{StorageBackend, VersionId, WritePrecondition, WriteResult};

use crate::content::ContentManifest;
use crate::error::{ReleaseError, Result};
use crate::manifest::Manifest;
use crate::paths;

/// Attempts made by [`ManifestStore::update`] before reporting a conflict.
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 8;

/// Reads and writes the version registry.
#[derive(Clone)]
pub struct ManifestStore {
    storage: Arc<dyn StorageBackend>,
    max_attempts: u32,
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ManifestStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            max_attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
    }

    /// Overrides how many optimistic attempts an update makes.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Loads the current registry.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if no registry has been written.
    pub async fn load(&self) -> Result<Manifest> {
        self.load_versioned().await.map(|(manifest, _)| manifest)
    }

    /// Loads the registry together with its storage version token.
    async fn load_versioned(&self) -> Result<(Manifest, String)> {
        // Version first, then content: a concurrent write makes the later CAS fail.
        let Some(meta) = self.storage.head(paths::MANIFEST).await? else {
            return Err(ReleaseError::not_found("manifest", paths::MANIFEST));
        };
        let bytes = match self.storage.get(paths::MANIFEST).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(ReleaseError::not_found("manifest", paths::MANIFEST));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok((manifest, meta.version))
    }

    /// Overwrites the registry unconditionally after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] if the registry breaks an invariant.
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        manifest.validate()?;
        let bytes = Bytes::from(serde_json::to_vec_pretty(manifest)?);
        self.storage
            .put(paths::MANIFEST, bytes, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Applies `mutate` to the current registry and writes it back atomically.
    ///
    /// `mutate` may run more than once if another writer interferes. If it
    /// returns an error nothing is written. The mutated registry is validated
    /// before every write.
    ///
    /// # Errors
    ///
    /// Returns the error from `mutate`, a validation error, or
    /// [`ReleaseError::Conflict`] once all attempts lose the race.
    pub async fn update<T, F>(&self, mut mutate: F) -> Result<(Manifest, T)>
    where
        F: FnMut(&mut Manifest) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 1..=self.max_attempts {
            let (mut manifest, version) = self.load_versioned().await?;
            let outcome = mutate(&mut manifest)?;
            manifest.validate()?;

            let bytes = Bytes::from(serde_json::to_vec_pretty(&manifest)?);
            match self
                .storage
                .put(
                    paths::MANIFEST,
                    bytes,
                    WritePrecondition::MatchesVersion(version),
                )
                .await?
            {
                WriteResult::Success { .. } => return Ok((manifest, outcome)),
                WriteResult::PreconditionFailed { current_version } => {
                    tracing::debug!(attempt, %current_version, "manifest changed underneath update; retrying");
                }
            }
        }
        Err(ReleaseError::conflict(
            "manifest was modified concurrently; retry the operation",
        ))
    }

    /// Writes `seed` only if no registry exists yet.
    ///
    /// Returns `true` if the seed was written.
    ///
    /// # Errors
    ///
    /// Returns a validation or storage error.
    pub async fn bootstrap(&self, seed: &Manifest) -> Result<bool> {
        seed.validate()?;
        let bytes = Bytes::from(serde_json::to_vec_pretty(seed)?);
        match self
            .storage
            .put(paths::MANIFEST, bytes, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(true),
            WriteResult::PreconditionFailed { .. } => Ok(false),
        }
    }

    /// Makes `version` the latest. Already-latest versions succeed unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the version is not registered.
    pub async fn mark_latest(&self, version: &VersionId) -> Result<Manifest> {
        let (manifest, changed) = self.update(|m| m.mark_latest(version)).await?;
        if changed {
            tracing::info!(%version, "marked version as latest");
        }
        Ok(manifest)
    }

    /// Loads the content manifest recorded for `version`, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub async fn load_content(&self, version: &VersionId) -> Result<Option<ContentManifest>> {
        match self.storage.get(&paths::content_manifest(version)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Records the content manifest for `version`.
    ///
    /// # Errors
    ///
    /// Returns a storage or encode error.
    pub async fn save_content(&self, version: &VersionId, content: &ContentManifest) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(content)?);
        self.storage
            .put(
                &paths::content_manifest(version),
                bytes,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Forgets the content manifest for `version`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delete_content(&self, version: &VersionId) -> Result<()> {
        self.storage
            .delete(&paths::content_manifest(version))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{VersionEntry, VersionStats, VersionStatus};
    use corehost_core::MemoryBackend;

    fn v(s: &str) -> VersionId {
        s.parse().unwrap()
    }

    fn store() -> ManifestStore {
        ManifestStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn load_without_registry_is_not_found() {
        let err = store().load().await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { entity: "manifest", .. }));
    }

    #[tokio::test]
    async fn bootstrap_writes_once() {
        let store = store();
        let seed = Manifest::seed(v("v1.0.0"), "Initial release", VersionStats::default());
        assert!(store.bootstrap(&seed).await.unwrap());

        let other = Manifest::seed(v("v9.0.0"), "other", VersionStats::default());
        assert!(!store.bootstrap(&other).await.unwrap());
        assert_eq!(store.load().await.unwrap().latest, v("v1.0.0"));
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let store = store();
        store
            .bootstrap(&Manifest::seed(v("v1.0.0"), "", VersionStats::default()))
            .await
            .unwrap();

        let err = store.mark_latest(&v("v2.0.0")).await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
        assert_eq!(store.load().await.unwrap().versions.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let store = store();
        store
            .bootstrap(&Manifest::seed(v("v1.0.0"), "", VersionStats::default()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for minor in 1..=4u32 {
            let store = store.clone().with_max_attempts(50);
            handles.push(tokio::spawn(async move {
                let id: VersionId = format!("v1.{minor}.0").parse().unwrap();
                store
                    .update(|m| {
                        m.versions
                            .push(VersionEntry::new(id.clone(), "", VersionStatus::Stable));
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.load().await.unwrap().versions.len(), 5);
    }

    #[tokio::test]
    async fn content_manifest_round_trips_by_version_triple() {
        let store = store();
        let mut content = ContentManifest::default();
        content.file_count = 2;
        store.save_content(&v("v1.0.0"), &content).await.unwrap();
        let loaded = store.load_content(&v("1.0.0")).await.unwrap().unwrap();
        assert_eq!(loaded.file_count, 2);
        store.delete_content(&v("v1.0.0")).await.unwrap();
        assert!(store.load_content(&v("v1.0.0")).await.unwrap().is_none());
    }
}
