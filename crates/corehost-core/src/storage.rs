//! Storage backend abstraction for corehost state.
//!
//! Every piece of durable metadata (the version registry, deployment jobs,
//! the instance directory, history entries and leases) is written through the
//! [`StorageBackend`] contract:
//! - Conditional writes with preconditions (compare-and-swap)
//! - Object metadata including `last_modified` and a version token
//!
//! The version token is an opaque `String`. [`MemoryBackend`] uses a numeric
//! counter; [`LocalFsBackend`] uses a digest of the stored bytes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for corehost metadata.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Results are returned in arbitrary order. Callers requiring
    /// deterministic order should sort them.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

// ============================================================================
// MemoryBackend
// ============================================================================

/// In-memory storage backend for tests and ephemeral deployments.
///
/// Thread-safe via `RwLock`. Uses numeric versions exposed as strings.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

// ============================================================================
// LocalFsBackend
// ============================================================================

/// Storage backend rooted at a local directory.
///
/// Keys map to relative file paths under the root. Writes go to a temporary
/// sibling file and are renamed into place, and a process-wide mutex makes
/// the precondition check and the rename a single step. The version token is
/// derived from the object's bytes.
#[derive(Debug)]
pub struct LocalFsBackend {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("create storage root {}", root.display()), e))?;
        Ok(Self {
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid storage key: {key:?}")));
        }
        Ok(self.root.join(relative))
    }

    async fn read_optional(path: &Path) -> Result<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("read {}", path.display()), e)),
        }
    }
}

fn content_version(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..16])
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        Self::read_optional(&file)
            .await?
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read_optional(&file)
            .await?
            .map(|bytes| content_version(&bytes));

        match (&precondition, &current) {
            (WritePrecondition::DoesNotExist, Some(existing)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(existing))
                if expected != existing =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }

        let version = content_version(&data);
        let mut tmp = file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|e| Error::io(format!("rename into {}", file.display()), e))?;

        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("delete {}", file.display()), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<ObjectMeta>> {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| Error::storage_with_source("walk storage root", e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(".tmp") || !key.starts_with(&prefix) {
                    continue;
                }
                let data = std::fs::read(entry.path())
                    .map_err(|e| Error::io(format!("read {}", entry.path().display()), e))?;
                let last_modified = entry.metadata().ok().as_ref().and_then(modified_at);
                out.push(ObjectMeta {
                    path: key,
                    size: data.len() as u64,
                    version: content_version(&data),
                    last_modified,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("list task failed: {e}"),
        })?
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let file = self.resolve(path)?;
        let Some(data) = Self::read_optional(&file).await? else {
            return Ok(None);
        };
        let last_modified = tokio::fs::metadata(&file)
            .await
            .ok()
            .as_ref()
            .and_then(modified_at);
        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size: data.len() as u64,
            version: content_version(&data),
            last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_cas(backend: &dyn StorageBackend) {
        let created = backend
            .put("reg/a.json", Bytes::from("v1"), WritePrecondition::DoesNotExist)
            .await
            .expect("put should succeed");
        let first_version = match created {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => panic!("expected success"),
        };

        let again = backend
            .put("reg/a.json", Bytes::from("v1b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put should succeed");
        assert!(matches!(again, WriteResult::PreconditionFailed { .. }));

        let updated = backend
            .put(
                "reg/a.json",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first_version.clone()),
            )
            .await
            .expect("put should succeed");
        assert!(matches!(updated, WriteResult::Success { .. }));

        let stale = backend
            .put(
                "reg/a.json",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first_version),
            )
            .await
            .expect("put should succeed");
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));

        assert_eq!(backend.get("reg/a.json").await.unwrap(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn memory_backend_honors_preconditions() {
        exercise_cas(&MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn local_backend_honors_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        exercise_cas(&backend).await;
    }

    #[tokio::test]
    async fn memory_backend_lists_by_prefix() {
        let backend = MemoryBackend::new();
        for key in ["a/1.json", "a/2.json", "b/1.json"] {
            backend
                .put(key, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }
        assert_eq!(backend.list("a/").await.unwrap().len(), 2);
        assert_eq!(backend.list("b/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_backend_lists_nested_keys_with_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        backend
            .put("history/instance=1/01.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .unwrap();
        backend
            .put("history/instance=2/01.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .unwrap();

        let listed = backend.list("history/instance=1/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "history/instance=1/01.json");
        assert!(listed[0].last_modified.is_some());
    }

    #[tokio::test]
    async fn local_backend_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        let result = backend.get("../outside.json").await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        let result = backend.get("/etc/passwd").await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        backend
            .put("gone.json", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();
        backend.delete("gone.json").await.unwrap();
        backend.delete("gone.json").await.unwrap();
        assert!(backend.head("gone.json").await.unwrap().is_none());
        assert!(backend.get("gone.json").await.unwrap_err().is_not_found());
    }
}
