//! Scoped storage leases.
//!
//! Instance leases serialize version changes on one instance. Version leases
//! are shared by deletion and by anything that points an instance at a
//! version, so a version cannot disappear between "it exists" and "the
//! instance now runs it". Callers that need both take the instance lease first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use corehost_core::{DistributedLock, StorageBackend, VersionId};

use crate::error::{ReleaseError, Result};
use crate::paths;

/// Lease TTL for one guarded operation.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Attempts made to obtain a lease before reporting a conflict.
pub const DEFAULT_LEASE_ATTEMPTS: u32 = 40;

/// Runs `work` while holding the lease at `path`.
///
/// The lease is released whatever `work` returns. A lease still held after
/// `attempts` tries becomes [`ReleaseError::Conflict`] with `busy` as its message.
pub(crate) async fn with_lease<T, F>(
    storage: &Arc<dyn StorageBackend>,
    path: String,
    attempts: u32,
    operation: &str,
    busy: impl FnOnce() -> String,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let lock = DistributedLock::new(Arc::clone(storage), path);
    let guard = lock
        .acquire_with_operation(DEFAULT_LEASE_TTL, attempts, Some(operation.to_string()))
        .await
        .map_err(|e| match e {
            corehost_core::Error::LockHeld { .. } => ReleaseError::conflict(busy()),
            other => other.into(),
        })?;

    let result = work.await;
    if let Err(error) = guard.release().await {
        tracing::warn!(%error, operation, "failed to release lease");
    }
    result
}

/// Runs `work` while holding the lease on `version`.
pub(crate) async fn with_version_lease<T, F>(
    storage: &Arc<dyn StorageBackend>,
    version: &VersionId,
    attempts: u32,
    operation: &str,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_lease(
        storage,
        paths::version_lock(version),
        attempts,
        operation,
        || format!("version {version} is being changed by another request"),
        work,
    )
    .await
}
