//! # corehost-core
//!
//! Shared primitives for the corehost version deployment service.
//!
//! This crate provides the building blocks used by every other corehost crate:
//!
//! - **Storage**: The [`StorageBackend`] contract with conditional (CAS) writes,
//!   plus in-memory and local-filesystem implementations
//! - **Leases**: [`DistributedLock`], a TTL lease built on CAS writes
//! - **Identifiers**: Strongly-typed IDs for jobs, history entries, and instances
//! - **Versions**: [`VersionId`], the `v?MAJOR.MINOR.PATCH` identifier
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use corehost_core::prelude::*;
//!
//! let version: VersionId = "v1.2.0".parse().unwrap();
//! assert_eq!(version.to_string(), "v1.2.0");
//!
//! let job = JobId::generate();
//! assert!(!job.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod storage;
pub mod version;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{HistoryEntryId, InstanceId, JobId};
    pub use crate::lock::{DistributedLock, LockGuard, LockInfo};
    pub use crate::storage::{
        LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::version::VersionId;
}

pub use error::{Error, Result};
pub use id::{HistoryEntryId, InstanceId, JobId};
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use observability::{LogFormat, init_logging};
pub use storage::{
    LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
pub use version::VersionId;
