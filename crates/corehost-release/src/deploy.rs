//! Deployment orchestration: compare upstream with the local registry,
//! materialize new versions, and maintain the registry.
//!
//! `start_deploy` validates the request, takes the deploy lease, persists a
//! queued [`DeploymentJob`], and returns. The four steps then run on a
//! background task that records its progress on the job:
//!
//! 1. synchronize the source checkout
//! 2. build the version's folder in a staging directory, move it to
//!    `<core_root>/versions/<version>/`, and hash it
//! 3. record the content manifest
//! 4. register the version as latest in the manifest
//!
//! The deploy lease is renewed between steps. A failed step leaves the
//! registry untouched. Whether the partial directory and content manifest
//! stay behind is a [`FailurePolicy`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::Instrument;

use corehost_core::observability::deploy_span;
use corehost_core::{DistributedLock, JobId, LockGuard, StorageBackend, VersionId};

use crate::content::{self, ContentManifest, IntegrityReport};
use crate::directory::InstanceDirectory;
use crate::error::{ReleaseError, Result};
use crate::jobs::{DeploymentJob, JobStore};
use crate::layout::{self, VersionLayout};
use crate::lease::{self, DEFAULT_LEASE_ATTEMPTS};
use crate::manifest::{LastDeployed, Manifest, VersionEntry, VersionStatus};
use crate::paths;
use crate::remote::RemoteManifestSource;
use crate::source::{SourceSnapshot, SourceTree};
use crate::store::ManifestStore;

/// Default lease on the deploy lock.
pub const DEFAULT_DEPLOY_LOCK_TTL: Duration = Duration::from_secs(600);

/// Default bound on remote fetches, source sync, and file work.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens to partial state when a deploy fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave the directory and content manifest for inspection.
    #[default]
    Retain,
    /// Remove the directory and content manifest.
    Cleanup,
}

impl FromStr for FailurePolicy {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(ReleaseError::validation(format!(
                "unknown deploy failure policy '{other}' (expected retain or cleanup)"
            ))),
        }
    }
}

/// Deployment tuning.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Lease on the deploy lock; must outlast a whole deployment.
    pub lock_ttl: Duration,
    /// Bound on remote fetches, source sync, and each file step.
    pub operation_timeout: Duration,
    /// Partial-state handling on failure.
    pub failure_policy: FailurePolicy,
    /// Folder inside the source checkout holding one folder per version.
    pub source_versions_dir: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_DEPLOY_LOCK_TTL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            failure_policy: FailurePolicy::Retain,
            source_versions_dir: PathBuf::from("core/versions"),
        }
    }
}

/// Upstream versus local comparison.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// True when upstream's latest differs from the local latest.
    pub has_new_version: bool,
    /// Upstream's latest version.
    pub remote_latest: VersionId,
    /// The local latest version.
    pub local_latest: VersionId,
    /// Every version upstream publishes.
    pub candidate_versions: Vec<VersionEntry>,
}

/// Coordinates the registry, the version trees, and deployment jobs.
pub struct DeploymentOrchestrator {
    storage: Arc<dyn StorageBackend>,
    manifests: ManifestStore,
    jobs: JobStore,
    directory: Arc<dyn InstanceDirectory>,
    layout: VersionLayout,
    remote: Option<Arc<dyn RemoteManifestSource>>,
    source: Option<Arc<dyn SourceTree>>,
    config: DeployConfig,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("layout", &self.layout)
            .field("remote", &self.remote.is_some())
            .field("source", &self.source.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestrator {
    /// Creates an orchestrator without an upstream. Status checks and
    /// deploys fail until [`Self::with_remote`] and [`Self::with_source`]
    /// are supplied.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        directory: Arc<dyn InstanceDirectory>,
        layout: VersionLayout,
        config: DeployConfig,
    ) -> Self {
        Self {
            manifests: ManifestStore::new(Arc::clone(&storage)),
            jobs: JobStore::new(Arc::clone(&storage)),
            storage,
            directory,
            layout,
            remote: None,
            source: None,
            config,
        }
    }

    /// Sets the upstream registry.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteManifestSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the source checkout new versions are copied from.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceTree>) -> Self {
        self.source = Some(source);
        self
    }

    /// The registry store.
    #[must_use]
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// The version tree layout.
    #[must_use]
    pub fn layout(&self) -> &VersionLayout {
        &self.layout
    }

    // ========================================================================
    // Registry reads
    // ========================================================================

    /// Lists every registered version with `instancesUsing` counted from the
    /// instance directory.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the registry was never created.
    pub async fn list_versions(&self) -> Result<Manifest> {
        let mut manifest = self.manifests.load().await?;
        let instances = self.directory.list_instances().await?;
        for entry in &mut manifest.versions {
            entry.stats.instances_using = instances
                .iter()
                .filter(|i| i.core_version == entry.version)
                .count() as u64;
        }
        Ok(manifest)
    }

    /// Compares upstream with the local registry. Never mutates anything.
    ///
    /// # Errors
    ///
    /// Propagates [`ReleaseError::UpstreamUnavailable`] and
    /// [`ReleaseError::MalformedResponse`] from the upstream.
    pub async fn check_status(&self) -> Result<DeploymentStatus> {
        let remote = self.remote()?;
        let upstream = timeout(self.config.operation_timeout, remote.fetch_manifest())
            .await
            .map_err(|_| ReleaseError::upstream("manifest fetch timed out"))??;
        let local = self.manifests.load().await?;

        Ok(DeploymentStatus {
            has_new_version: upstream.latest != local.latest,
            remote_latest: upstream.latest,
            local_latest: local.latest,
            candidate_versions: upstream.versions,
        })
    }

    /// Fetches one file of a materialized version.
    ///
    /// The path is checked before anything else, so a traversal attempt is
    /// rejected even for an unknown version.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] for a malformed version or a path
    /// escaping the version root, and [`ReleaseError::NotFound`] if the
    /// version or file does not exist.
    pub async fn core_file(&self, version: &str, relative: &str) -> Result<Vec<u8>> {
        let version: VersionId = version.parse()?;
        layout::validate_relative(relative)?;

        let manifest = self.manifests.load().await?;
        let Some(entry) = manifest.find(&version) else {
            return Err(ReleaseError::not_found("version", &version));
        };
        let path = self.layout.resolve_file(&entry.version, relative)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ReleaseError::io(format!("read {}", path.display()), e))
    }

    /// Re-hashes a version's tree against its content manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the version or its content
    /// manifest does not exist.
    pub async fn verify_version(&self, version: &str) -> Result<IntegrityReport> {
        let version: VersionId = version.parse()?;
        let manifest = self.manifests.load().await?;
        let Some(entry) = manifest.find(&version) else {
            return Err(ReleaseError::not_found("version", &version));
        };
        let Some(expected) = self.manifests.load_content(&entry.version).await? else {
            return Err(ReleaseError::not_found("content manifest", &version));
        };

        let root = self.layout.version_dir(&entry.version);
        let report = self
            .blocking("verify version tree", move || content::verify(&root, &expected))
            .await?;
        if report.is_intact() {
            tracing::info!(%version, checked = report.checked, "version tree intact");
        } else {
            tracing::warn!(
                %version,
                missing = report.missing.len(),
                mismatched = report.mismatched.len(),
                extra = report.extra.len(),
                "version tree differs from its content manifest"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Registry writes
    // ========================================================================

    /// Creates the registry with `seed` as its only version if none exists.
    ///
    /// If the seed's directory is already present its content manifest and
    /// stats are recorded. Returns `true` if the registry was created.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] for a malformed version, or a
    /// storage or IO error.
    pub async fn bootstrap(&self, seed: &str, description: &str) -> Result<bool> {
        let version: VersionId = seed.parse()?;
        let dir = self.layout.version_dir(&version);
        let content = if dir.is_dir() {
            Some(self.blocking("hash seed version", move || content::hash_tree(&dir)).await?)
        } else {
            None
        };
        let stats = content.as_ref().map(ContentManifest::stats).unwrap_or_default();

        let created = self
            .manifests
            .bootstrap(&Manifest::seed(version.clone(), description, stats))
            .await?;
        if created {
            if let Some(content) = &content {
                self.manifests.save_content(&version, content).await?;
            }
            tracing::info!(%version, files = stats.file_count, "created version registry");
        }
        Ok(created)
    }

    /// Makes `version` the latest. Already-latest is a success.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] for a malformed version and
    /// [`ReleaseError::NotFound`] if it is not registered.
    pub async fn mark_latest(&self, version: &str) -> Result<Manifest> {
        let version: VersionId = version.parse()?;
        self.manifests.mark_latest(&version).await
    }

    /// Removes a version's registry entry, tree, and content manifest.
    ///
    /// The usage check and the registry removal run under the version's
    /// lease, which instance updates and rollbacks also take before pointing
    /// an instance at it.
    ///
    /// # Errors
    ///
    /// - [`ReleaseError::NotFound`] if the version is not registered
    /// - [`ReleaseError::InvalidOperation`] if it is the latest or any
    ///   instance runs it
    /// - [`ReleaseError::Conflict`] if the version stays busy
    pub async fn delete_version(&self, version: &str) -> Result<VersionEntry> {
        let version: VersionId = version.parse()?;
        let removed = lease::with_version_lease(
            &self.storage,
            &version,
            DEFAULT_LEASE_ATTEMPTS,
            "delete_version",
            self.unregister(&version),
        )
        .await?;

        let dir = self.layout.version_dir(&removed.version);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ReleaseError::io(format!("remove {}", dir.display()), e));
            }
        }
        self.manifests.delete_content(&removed.version).await?;

        tracing::info!(version = %removed.version, "deleted version");
        Ok(removed)
    }

    async fn unregister(&self, version: &VersionId) -> Result<VersionEntry> {
        let manifest = self.manifests.load().await?;
        if !manifest.contains(version) {
            return Err(ReleaseError::not_found("version", version));
        }
        if manifest.latest == *version {
            return Err(ReleaseError::invalid_operation(
                "Cannot delete the latest version; mark another version latest first",
            ));
        }
        let in_use = self.directory.count_instances_on(version).await?;
        if in_use > 0 {
            return Err(ReleaseError::invalid_operation(format!(
                "Cannot delete version {version}: used by {in_use} instance(s)"
            )));
        }

        let (_, removed) = self.manifests.update(|m| m.remove(version)).await?;
        Ok(removed)
    }

    // ========================================================================
    // Deployment jobs
    // ========================================================================

    /// Lists deployment jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub async fn list_jobs(&self) -> Result<Vec<DeploymentJob>> {
        self.jobs.list().await
    }

    /// Fetches one deployment job.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if no such job exists.
    pub async fn get_job(&self, id: &JobId) -> Result<DeploymentJob> {
        self.jobs.get(id).await
    }

    /// Fails jobs left `queued` or `running` by a previous process.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub async fn recover_interrupted(&self) -> Result<Vec<DeploymentJob>> {
        self.jobs.fail_interrupted().await
    }

    /// Accepts a deployment and starts it in the background.
    ///
    /// Returns the queued job. Poll [`Self::get_job`] for its outcome.
    ///
    /// # Errors
    ///
    /// - [`ReleaseError::Validation`] for a malformed or already registered version
    /// - [`ReleaseError::Conflict`] if another deployment is in progress
    /// - [`ReleaseError::UpstreamUnavailable`] if no source is configured
    pub async fn start_deploy(self: &Arc<Self>, version: &str, description: &str) -> Result<DeploymentJob> {
        let version: VersionId = version.parse()?;
        self.ensure_unregistered(&version).await?;
        self.source()?;

        let lock = DistributedLock::new(Arc::clone(&self.storage), paths::DEPLOY_LOCK);
        let guard = lock
            .acquire_with_operation(self.config.lock_ttl, 1, Some(format!("deploy {version}")))
            .await
            .map_err(|e| match e {
                corehost_core::Error::LockHeld { holder, .. } => ReleaseError::conflict(format!(
                    "a deployment is already in progress (holder {holder})"
                )),
                other => other.into(),
            })?;

        // Another deploy may have registered the version while we waited.
        let accepted = async {
            self.ensure_unregistered(&version).await?;
            let job = DeploymentJob::new(version.clone(), description);
            self.jobs.save(&job).await?;
            Ok::<_, ReleaseError>(job)
        }
        .await;
        let job = match accepted {
            Ok(job) => job,
            Err(e) => {
                if let Err(release) = guard.release().await {
                    tracing::warn!(error = %release, "failed to release deploy lock");
                }
                return Err(e);
            }
        };

        tracing::info!(job_id = %job.id, %version, "deployment queued");
        let span = deploy_span("deploy", version.as_str());
        let worker = Arc::clone(self);
        let queued = job.clone();
        tokio::spawn(async move { worker.run(queued, guard).await }.instrument(span));

        Ok(job)
    }

    async fn ensure_unregistered(&self, version: &VersionId) -> Result<()> {
        if self.manifests.load().await?.contains(version) {
            return Err(ReleaseError::validation(format!(
                "Version {version} already exists"
            )));
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut job: DeploymentJob, mut guard: LockGuard<dyn StorageBackend>) {
        let outcome = match self.execute(&mut job, &mut guard).await {
            Ok(()) => {
                job.succeed();
                tracing::info!(job_id = %job.id, version = %job.version, "deployment succeeded");
                "succeeded"
            }
            Err(error) => {
                job.fail(error.to_string());
                tracing::error!(
                    job_id = %job.id,
                    version = %job.version,
                    step = job.failed_step().map(|s| s.name.as_str()),
                    %error,
                    "deployment failed"
                );
                self.apply_failure_policy(&job.version).await;
                "failed"
            }
        };
        metrics::counter!("deploy_jobs_total", "outcome" => outcome).increment(1);

        if let Err(error) = self.jobs.save(&job).await {
            tracing::error!(job_id = %job.id, %error, "failed to record deployment outcome");
        }
        if let Err(error) = guard.release().await {
            tracing::warn!(job_id = %job.id, %error, "failed to release deploy lock");
        }
    }

    async fn execute(
        &self,
        job: &mut DeploymentJob,
        guard: &mut LockGuard<dyn StorageBackend>,
    ) -> Result<()> {
        job.start();
        self.jobs.save(job).await?;

        job.begin_step(0);
        self.jobs.save(job).await?;
        let snapshot = self.synchronize().await?;
        job.complete_step(0);
        self.renew(guard).await?;

        job.begin_step(1);
        self.jobs.save(job).await?;
        let source_dir = self.locate_source(&snapshot, &job.version)?;
        let staging = self.layout.staging_dir(&job.version);
        let dest = self.layout.version_dir(&job.version);
        tracing::info!(source = %source_dir.display(), dest = %dest.display(), "materializing version tree");
        let tree = self
            .blocking("materialize version tree", move || {
                content::materialize(&source_dir, &staging, &dest)
            })
            .await?;
        job.complete_step(1);
        self.renew(guard).await?;

        job.begin_step(2);
        self.jobs.save(job).await?;
        self.manifests.save_content(&job.version, &tree).await?;
        job.complete_step(2);
        self.renew(guard).await?;

        job.begin_step(3);
        self.jobs.save(job).await?;
        let mut entry = VersionEntry::new(job.version.clone(), job.description.clone(), VersionStatus::Latest);
        entry.stats = tree.stats();
        let last_deployed = LastDeployed {
            version: job.version.clone(),
            deployed_at: Utc::now(),
            source_fingerprint: snapshot.fingerprint,
        };
        self.manifests
            .update(|m| {
                m.insert_latest(entry.clone())?;
                m.last_deployed = Some(last_deployed.clone());
                Ok(())
            })
            .await?;
        job.complete_step(3);

        tracing::info!(files = tree.file_count, bytes = tree.total_size, "registered new latest version");
        Ok(())
    }

    /// Pushes the deploy lease's expiry out by a full TTL.
    async fn renew(&self, guard: &mut LockGuard<dyn StorageBackend>) -> Result<()> {
        guard.extend(self.config.lock_ttl).await.map_err(|e| match e {
            corehost_core::Error::PreconditionFailed { .. } | corehost_core::Error::NotFound(_) => {
                ReleaseError::conflict("deploy lock was taken over by another holder")
            }
            other => other.into(),
        })
    }

    async fn synchronize(&self) -> Result<SourceSnapshot> {
        let source = self.source()?;
        timeout(self.config.operation_timeout, source.synchronize())
            .await
            .map_err(|_| ReleaseError::upstream("source synchronization timed out"))?
    }

    /// Finds the version's folder in the checkout, accepting `1.2.0` and
    /// `v1.2.0` spellings.
    fn locate_source(&self, snapshot: &SourceSnapshot, version: &VersionId) -> Result<PathBuf> {
        let base = snapshot.root.join(&self.config.source_versions_dir);
        let (major, minor, patch) = version.triple();
        let bare = format!("{major}.{minor}.{patch}");
        let candidates = [version.as_str().to_string(), format!("v{bare}"), bare];
        candidates
            .iter()
            .map(|name| base.join(name))
            .find(|path| path.is_dir())
            .ok_or_else(|| {
                ReleaseError::not_found("version source", base.join(version.as_str()).display())
            })
    }

    async fn apply_failure_policy(&self, version: &VersionId) {
        if self.config.failure_policy == FailurePolicy::Retain {
            tracing::info!(%version, "retaining partial deployment state");
            return;
        }
        // Never remove a tree the registry knows about.
        match self.manifests.load().await {
            Ok(manifest) if !manifest.contains(version) => {}
            Ok(_) => return,
            Err(error) => {
                tracing::warn!(%version, %error, "skipping cleanup; registry unreadable");
                return;
            }
        }

        for dir in [self.layout.staging_dir(version), self.layout.version_dir(version)] {
            if let Err(error) = remove_tree(&dir).await {
                tracing::warn!(%version, %error, dir = %dir.display(), "failed to remove partial version tree");
            }
        }
        if let Err(error) = self.manifests.delete_content(version).await {
            tracing::warn!(%version, %error, "failed to remove partial content manifest");
        }
        tracing::info!(%version, "cleaned up partial deployment state");
    }

    async fn blocking<T, F>(&self, what: &'static str, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        timeout(self.config.operation_timeout, tokio::task::spawn_blocking(work))
            .await
            .map_err(|_| {
                ReleaseError::io(
                    what,
                    format!("timed out after {}s", self.config.operation_timeout.as_secs()),
                )
            })?
            .map_err(|e| ReleaseError::internal(format!("{what} task failed: {e}")))?
    }

    fn remote(&self) -> Result<&Arc<dyn RemoteManifestSource>> {
        self.remote
            .as_ref()
            .ok_or_else(|| ReleaseError::upstream("no upstream manifest URL is configured"))
    }

    fn source(&self) -> Result<&Arc<dyn SourceTree>> {
        self.source
            .as_ref()
            .ok_or_else(|| ReleaseError::upstream("no source checkout is configured"))
    }
}

async fn remove_tree(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
