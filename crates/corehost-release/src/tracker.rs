//! Per-instance version pointer: read, update, rollback, history.
//!
//! Version changes on the same instance are serialized by a storage lease,
//! so two administrators racing produce two consecutive history entries
//! instead of one lost update. The target version's lease is held from the
//! registry check until the instance points at it, which keeps a concurrent
//! delete from removing it in between.
//!
//! ## Rollback resolution
//!
//! Rollback does not simply undo the last change. Among the instance's
//! `completed` entries, newest first, it skips the most recent one and
//! returns the instance to the `fromVersion` of the next one. With history
//! `v1→v2, v2→v3` an instance on `v3` rolls back to `v1`. Rollback entries
//! themselves are recorded as `rolled_back` and never count as `completed`.

use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use corehost_core::observability::instance_span;
use corehost_core::{InstanceId, StorageBackend, VersionId};

use crate::directory::{Instance, InstanceDirectory};
use crate::error::{ReleaseError, Result};
use crate::history::{HistoryEntry, HistoryStatus, VersionHistoryLedger};
use crate::lease::{self, DEFAULT_LEASE_ATTEMPTS};
use crate::paths;
use crate::store::ManifestStore;

/// Note recorded on rollback entries.
pub const ROLLBACK_NOTE: &str = "Rollback initiated";

/// Outcome of a successful update or rollback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionChange {
    /// Human-readable summary.
    pub message: String,
    /// The instance after the change.
    pub instance: Instance,
    /// The history entry recording the change.
    pub entry: HistoryEntry,
}

#[derive(Clone, Copy)]
enum TransitionKind {
    Update,
    Rollback,
}

impl TransitionKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Rollback => "rollback",
        }
    }
}

/// Moves instances between registered versions.
#[derive(Clone)]
pub struct InstanceVersionTracker {
    storage: Arc<dyn StorageBackend>,
    manifests: ManifestStore,
    directory: Arc<dyn InstanceDirectory>,
    ledger: VersionHistoryLedger,
    lock_attempts: u32,
}

impl std::fmt::Debug for InstanceVersionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceVersionTracker")
            .field("lock_attempts", &self.lock_attempts)
            .finish_non_exhaustive()
    }
}

impl InstanceVersionTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        manifests: ManifestStore,
        directory: Arc<dyn InstanceDirectory>,
    ) -> Self {
        Self {
            ledger: VersionHistoryLedger::new(Arc::clone(&storage)),
            storage,
            manifests,
            directory,
            lock_attempts: DEFAULT_LEASE_ATTEMPTS,
        }
    }

    /// Overrides how many times a busy instance or version lease is retried.
    #[must_use]
    pub fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = attempts.max(1);
        self
    }

    /// The history ledger backing this tracker.
    #[must_use]
    pub fn ledger(&self) -> &VersionHistoryLedger {
        &self.ledger
    }

    /// Returns the instance and the version it runs.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the instance does not exist.
    pub async fn get_current_version(&self, instance_id: InstanceId) -> Result<Instance> {
        self.directory
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| ReleaseError::not_found("instance", instance_id))
    }

    /// Lists the instance's history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if the instance does not exist.
    pub async fn history(&self, instance_id: InstanceId) -> Result<Vec<HistoryEntry>> {
        self.get_current_version(instance_id).await?;
        self.ledger.list_by_instance(instance_id).await
    }

    /// Moves the instance to `target`.
    ///
    /// # Errors
    ///
    /// - [`ReleaseError::Forbidden`] unless `acting_user` administers the instance
    /// - [`ReleaseError::NotFound`] if the instance does not exist
    /// - [`ReleaseError::Validation`] if `target` is not registered; nothing is recorded
    /// - [`ReleaseError::Conflict`] if the instance or the version stays busy
    pub async fn update_version(
        &self,
        instance_id: InstanceId,
        target: &VersionId,
        acting_user: Option<u64>,
    ) -> Result<VersionChange> {
        self.authorize(instance_id, acting_user, "update versions")
            .await?;
        let span = instance_span("update_version", instance_id.get());
        self.with_instance_lock(instance_id, "update_version", async {
            let instance = self.get_current_version(instance_id).await?;
            self.with_version_lock(target, "update_version", async {
                let manifest = self.manifests.load().await?;
                let Some(entry) = manifest.find(target) else {
                    return Err(ReleaseError::validation(format!(
                        "Version {target} does not exist"
                    )));
                };
                let target = entry.version.clone();
                let message = format!("Updated from {} to {}", instance.core_version, target);
                self.transition(instance, target, TransitionKind::Update, message)
                    .await
            })
            .await
        })
        .instrument(span)
        .await
    }

    /// Returns the instance to the version active before its previous
    /// completed update. See the module docs for the exact rule.
    ///
    /// # Errors
    ///
    /// - [`ReleaseError::Forbidden`] unless `acting_user` administers the instance
    /// - [`ReleaseError::NotFound`] if the instance does not exist
    /// - [`ReleaseError::InvalidOperation`] with fewer than two completed
    ///   entries, or if the target version has since been deleted
    /// - [`ReleaseError::Conflict`] if the instance or the version stays busy
    pub async fn rollback(
        &self,
        instance_id: InstanceId,
        acting_user: Option<u64>,
    ) -> Result<VersionChange> {
        self.authorize(instance_id, acting_user, "rollback versions")
            .await?;
        let span = instance_span("rollback", instance_id.get());
        self.with_instance_lock(instance_id, "rollback", async {
            let instance = self.get_current_version(instance_id).await?;
            let Some(previous) = self.ledger.find_completed_before(instance_id, 1).await? else {
                return Err(ReleaseError::invalid_operation(
                    "No previous version to rollback to",
                ));
            };
            let wanted = previous.from_version;
            self.with_version_lock(&wanted, "rollback", async {
                let manifest = self.manifests.load().await?;
                let Some(entry) = manifest.find(&wanted) else {
                    return Err(ReleaseError::invalid_operation(format!(
                        "Rollback target {wanted} is no longer available"
                    )));
                };
                let target = entry.version.clone();
                let message = format!("Rolled back to {target}");
                self.transition(instance, target, TransitionKind::Rollback, message)
                    .await
            })
            .await
        })
        .instrument(span)
        .await
    }

    async fn authorize(
        &self,
        instance_id: InstanceId,
        acting_user: Option<u64>,
        action: &str,
    ) -> Result<()> {
        let Some(user_id) = acting_user else {
            return Err(ReleaseError::forbidden(format!(
                "Only instance admins can {action}"
            )));
        };
        match self.directory.find_user(user_id).await? {
            Some(user) if user.is_admin_of(instance_id) => Ok(()),
            _ => Err(ReleaseError::forbidden(format!(
                "Only instance admins can {action}"
            ))),
        }
    }

    async fn with_instance_lock<T, F>(&self, instance_id: InstanceId, operation: &str, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        lease::with_lease(
            &self.storage,
            paths::instance_lock(instance_id),
            self.lock_attempts,
            operation,
            || format!("instance {instance_id} is being changed by another request"),
            work,
        )
        .await
    }

    async fn with_version_lock<T, F>(&self, version: &VersionId, operation: &str, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        lease::with_version_lease(&self.storage, version, self.lock_attempts, operation, work).await
    }

    async fn transition(
        &self,
        instance: Instance,
        target: VersionId,
        kind: TransitionKind,
        message: String,
    ) -> Result<VersionChange> {
        let mut entry = HistoryEntry::pending(instance.id, instance.core_version.clone(), target.clone());
        let terminal = match kind {
            TransitionKind::Update => HistoryStatus::Completed,
            TransitionKind::Rollback => {
                entry = entry.with_notes(ROLLBACK_NOTE);
                HistoryStatus::RolledBack
            }
        };
        self.ledger.append(&entry).await?;

        let updated = match self.directory.set_core_version(instance.id, &target).await {
            Ok(updated) => updated,
            Err(error) => {
                let note = Some(format!("version change failed: {error}"));
                if let Err(mark) = self
                    .ledger
                    .finish(instance.id, &entry.id, HistoryStatus::Failed, note)
                    .await
                {
                    tracing::warn!(instance_id = %instance.id, error = %mark, "history entry left pending");
                }
                return Err(error);
            }
        };

        let entry = self
            .ledger
            .finish(instance.id, &entry.id, terminal, None)
            .await?;

        metrics::counter!("version_transitions_total", "kind" => kind.label()).increment(1);
        tracing::info!(
            instance_id = %instance.id,
            from = %entry.from_version,
            to = %entry.to_version,
            kind = kind.label(),
            "instance version changed"
        );

        Ok(VersionChange {
            message,
            instance: updated,
            entry,
        })
    }
}
