//! Storage-backed leases that serialize deployments and per-instance changes.
//!
//! A lease is a small JSON record written with compare-and-swap:
//! - Acquisition writes the record with `DoesNotExist`, or takes over an
//!   expired record by matching its version token
//! - Every record carries an expiry so a crashed holder cannot block others forever
//! - Release rewrites the record as already expired, guarded by the holder's
//!   version token, so a newer holder is never evicted
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(storage.clone(), "locks/deploy.lock.json");
//! let guard = lock.acquire(Duration::from_secs(600), 1).await?;
//! // ... materialize the version ...
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

const BACKOFF_BASE: Duration = Duration::from_millis(25);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Lease record contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lease holder ID.
    pub holder_id: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Incremented on every acquisition of this lease path.
    #[serde(default)]
    pub sequence_number: u64,

    /// What the holder is doing, for operators reading the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a lease record for `holder_id` that expires after `ttl`.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now + to_chrono(ttl),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Internal {
                message: format!("serialize lock: {e}"),
            })
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

async fn read_info<S: StorageBackend + ?Sized>(storage: &S, path: &str) -> Result<Option<LockInfo>> {
    match storage.get(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::Internal {
                message: format!("parse lock {path}: {e}"),
            }),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// A lease on a storage path.
pub struct DistributedLock<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
}

impl<S: StorageBackend + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> DistributedLock<S> {
    /// Creates a lease handle with a fresh holder ID.
    #[must_use]
    pub fn new(storage: Arc<S>, lock_path: impl Into<String>) -> Self {
        Self {
            storage,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this handle.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lease, retrying up to `max_attempts` times in total.
    ///
    /// With `max_attempts == 1` a held lease fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockHeld`] if the lease is still held after every
    /// attempt, or a storage error.
    pub async fn acquire(&self, ttl: Duration, max_attempts: u32) -> Result<LockGuard<S>> {
        self.acquire_with_operation(ttl, max_attempts, None).await
    }

    /// Acquires the lease and records what the holder is doing.
    ///
    /// # Errors
    ///
    /// Same as [`DistributedLock::acquire`].
    pub async fn acquire_with_operation(
        &self,
        ttl: Duration,
        max_attempts: u32,
        operation: Option<String>,
    ) -> Result<LockGuard<S>> {
        let mut attempts = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(ttl, operation.clone()).await? {
                Acquire::Acquired(guard) => return Ok(guard),
                Acquire::Held(holder) => {
                    attempts += 1;
                    if attempts >= max_attempts.max(1) {
                        return Err(Error::LockHeld {
                            path: self.lock_path.clone(),
                            holder,
                        });
                    }
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(rand_jitter());
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    async fn try_acquire(&self, ttl: Duration, operation: Option<String>) -> Result<Acquire<S>> {
        let mut fresh = LockInfo::new(&self.holder_id, ttl, 1);
        fresh.operation.clone_from(&operation);

        if let WriteResult::Success { version } = self
            .storage
            .put(&self.lock_path, fresh.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            return Ok(Acquire::Acquired(self.guard(version)));
        }

        // Take the version token before reading the record so the expiry
        // decision and the takeover CAS refer to the same record.
        let Some(meta) = self.storage.head(&self.lock_path).await? else {
            return Ok(Acquire::Held("race".into()));
        };

        match read_info(self.storage.as_ref(), &self.lock_path).await? {
            Some(info) if info.is_expired() => {
                let sequence = info.sequence_number.saturating_add(1);
                let mut takeover = LockInfo::new(&self.holder_id, ttl, sequence);
                takeover.operation = operation;

                match self
                    .storage
                    .put(
                        &self.lock_path,
                        takeover.to_bytes()?,
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await?
                {
                    WriteResult::Success { version } => {
                        Ok(Acquire::Acquired(self.guard(version)))
                    }
                    WriteResult::PreconditionFailed { .. } => Ok(Acquire::Held("unknown".into())),
                }
            }
            Some(info) => Ok(Acquire::Held(info.holder_id)),
            None => Ok(Acquire::Held("race".into())),
        }
    }

    fn guard(&self, version: String) -> LockGuard<S> {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            released: false,
        }
    }
}

enum Acquire<S: StorageBackend + ?Sized> {
    Acquired(LockGuard<S>),
    Held(String),
}

/// RAII guard for a held lease.
///
/// Dropping the guard releases the lease in the background when a Tokio
/// runtime is available; otherwise the TTL reclaims it.
pub struct LockGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
    version: String,
    released: bool,
}

impl<S: StorageBackend + ?Sized> std::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> LockGuard<S> {
    /// Returns the holder ID for this lease.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease record could not be rewritten.
    pub async fn release(mut self) -> Result<()> {
        let result = release_record(
            self.storage.as_ref(),
            &self.lock_path,
            &self.holder_id,
            &self.version,
        )
        .await;
        self.released = true;
        result
    }

    /// Pushes the expiry `additional_ttl` into the future.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] if another holder took the lease.
    pub async fn extend(&mut self, additional_ttl: Duration) -> Result<()> {
        let Some(mut info) = read_info(self.storage.as_ref(), &self.lock_path).await? else {
            return Err(Error::NotFound(self.lock_path.clone()));
        };
        if info.holder_id != self.holder_id {
            return Err(Error::PreconditionFailed {
                message: "lock held by different holder".into(),
            });
        }
        info.expires_at = Utc::now() + to_chrono(additional_ttl);

        match self
            .storage
            .put(
                &self.lock_path,
                info.to_bytes()?,
                WritePrecondition::MatchesVersion(self.version.clone()),
            )
            .await?
        {
            WriteResult::Success { version } => {
                self.version = version;
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                message: "lock modified by another holder".into(),
            }),
        }
    }
}

/// Rewrites the record as expired if it still belongs to `holder_id` at `version`.
async fn release_record<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
    holder_id: &str,
    version: &str,
) -> Result<()> {
    let Some(info) = read_info(storage, path).await? else {
        return Ok(());
    };
    if info.holder_id != holder_id {
        return Ok(());
    }
    let expired = LockInfo {
        expires_at: Utc::now() - chrono::Duration::seconds(1),
        operation: None,
        ..info
    };
    // A failed precondition means someone else owns the record now.
    let _ = storage
        .put(
            path,
            expired.to_bytes()?,
            WritePrecondition::MatchesVersion(version.to_string()),
        )
        .await?;
    Ok(())
}

impl<S: StorageBackend + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = Arc::clone(&self.storage);
        let path = std::mem::take(&mut self.lock_path);
        let holder = std::mem::take(&mut self.holder_id);
        let version = std::mem::take(&mut self.version);
        handle.spawn(async move {
            if let Err(error) = release_record(storage.as_ref(), &path, &holder, &version).await {
                tracing::warn!(%path, %error, "failed to release lock on drop");
            }
        });
    }
}

/// Random jitter for backoff (0-20ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 20
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn storage() -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn second_holder_is_rejected_while_lease_is_live() {
        let storage = storage();
        let first = DistributedLock::new(storage.clone(), "locks/deploy.lock.json");
        let second = DistributedLock::new(storage.clone(), "locks/deploy.lock.json");

        let guard = first.acquire(Duration::from_secs(30), 1).await.unwrap();
        let err = second.acquire(Duration::from_secs(30), 1).await.unwrap_err();
        assert!(matches!(err, Error::LockHeld { ref holder, .. } if holder == first.holder_id()));

        guard.release().await.unwrap();
        let _guard = second.acquire(Duration::from_secs(30), 1).await.unwrap();
        let info = read_info(storage.as_ref(), "locks/deploy.lock.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.sequence_number, 2);
        assert_eq!(info.holder_id, second.holder_id());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let storage = storage();
        let stale = DistributedLock::new(storage.clone(), "locks/a.json");
        let fresh = DistributedLock::new(storage.clone(), "locks/a.json");

        let guard = stale.acquire(Duration::from_millis(1), 1).await.unwrap();
        std::mem::forget(guard);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let taken = fresh.acquire(Duration::from_secs(30), 1).await.unwrap();
        assert_eq!(taken.holder_id(), fresh.holder_id());
        let info = read_info(storage.as_ref(), "locks/a.json").await.unwrap().unwrap();
        assert!(!info.is_expired());
    }

    #[tokio::test]
    async fn release_does_not_evict_new_holder() {
        let storage = storage();
        let old = DistributedLock::new(storage.clone(), "locks/b.json");
        let new = DistributedLock::new(storage.clone(), "locks/b.json");

        let old_guard = old.acquire(Duration::from_millis(1), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _new_guard = new.acquire(Duration::from_secs(30), 1).await.unwrap();

        old_guard.release().await.unwrap();
        let info = read_info(storage.as_ref(), "locks/b.json").await.unwrap().unwrap();
        assert_eq!(info.holder_id, new.holder_id());
        assert!(!info.is_expired());
    }

    #[tokio::test]
    async fn waiting_holder_gets_lease_after_release() {
        let storage = storage();
        let first = DistributedLock::new(storage.clone(), "locks/c.json");
        let second = DistributedLock::new(storage, "locks/c.json");

        let guard = first.acquire(Duration::from_secs(30), 1).await.unwrap();
        let waiter = tokio::spawn(async move { second.acquire(Duration::from_secs(30), 50).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        guard.release().await.unwrap();

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn extend_pushes_expiry() {
        let storage = storage();
        let lock = DistributedLock::new(storage.clone(), "locks/d.json");
        let mut guard = lock.acquire(Duration::from_millis(50), 1).await.unwrap();
        let before = read_info(storage.as_ref(), "locks/d.json").await.unwrap().unwrap();
        guard.extend(Duration::from_secs(60)).await.unwrap();
        let after = read_info(storage.as_ref(), "locks/d.json").await.unwrap().unwrap();
        assert!(after.expires_at > before.expires_at);

        // A rival cannot take the extended lease, and the extended guard still releases it.
        let rival = DistributedLock::new(storage.clone(), "locks/d.json");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rival.acquire(Duration::from_secs(30), 1).await.is_err());
        guard.release().await.unwrap();
        assert!(rival.acquire(Duration::from_secs(30), 1).await.is_ok());
    }
}
