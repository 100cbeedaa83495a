//! Test storage with operation tracing and failure injection.
//!
//! Wraps [`MemoryBackend`] so CAS semantics match production tests exactly,
//! while recording every call for assertions.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use corehost_core::error::{Error, Result};
use corehost_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

/// Which calls an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// Every call touching the prefix.
    All,
    /// Only writes (`put`) under the prefix.
    Writes,
}

/// In-memory storage backend with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: Arc<MemoryBackend>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<(String, FailOn)>>>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the paths written so far, in order.
    #[must_use]
    pub fn written_paths(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                StorageOp::Put { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Injects a failure for every call under the given path prefix.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths
            .lock()
            .expect("lock")
            .push((prefix.into(), FailOn::All));
    }

    /// Injects a failure for writes under the given path prefix.
    pub fn inject_write_failure(&self, prefix: impl Into<String>) {
        self.fail_paths
            .lock()
            .expect("lock")
            .push((prefix.into(), FailOn::Writes));
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str, write: bool) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        let hit = fail_paths
            .iter()
            .any(|(prefix, on)| path.starts_with(prefix.as_str()) && (write || *on == FailOn::All));
        if hit {
            return Err(Error::Internal {
                message: format!("Injected failure for path: {path}"),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.check_failure(path, false)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_failure(path, true)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_failure(path, false)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check_failure(prefix, false)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.check_failure(path, false)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_injects() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("a/1", Bytes::from_static(b"x"), WritePrecondition::None)
            .await
            .unwrap();
        assert_eq!(storage.written_paths(), vec!["a/1".to_string()]);

        storage.inject_write_failure("a/");
        assert!(storage.get("a/1").await.is_ok());
        assert!(
            storage
                .put("a/2", Bytes::new(), WritePrecondition::None)
                .await
                .is_err()
        );

        storage.clear_failures();
        storage.inject_failure("a/");
        assert!(storage.get("a/1").await.is_err());
    }
}
