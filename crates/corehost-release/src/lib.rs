//! # corehost-release
//!
//! Version lifecycle for corehost: which core versions exist, how new ones
//! are deployed, and which version each instance runs.
//!
//! - **Registry**: [`Manifest`] and its invariants, persisted by [`ManifestStore`]
//! - **Upstream**: [`RemoteManifestSource`] for published versions and
//!   [`SourceTree`] for the files behind them
//! - **Deployment**: [`DeploymentOrchestrator`] materializes versions on a
//!   background task tracked by a persisted [`DeploymentJob`]
//! - **Instances**: [`InstanceVersionTracker`] updates and rolls back
//!   instances, recording every change in the [`VersionHistoryLedger`]
//!
//! ## Guarantees
//!
//! - Exactly one registry entry is `latest`, checked before every write
//! - Registry writes are compare-and-swap; concurrent writers retry or conflict
//! - Deployments are serialized by a storage lease, renewed between steps
//! - A deployed version's directory never keeps files from an earlier attempt
//! - Version changes on one instance are serialized by a per-instance lease
//! - A version cannot be deleted while an instance is being moved onto it
//! - Core files are only served from inside their version's directory
//!
//! ## Example
//!
//! ```rust
//! use corehost_release::manifest::{Manifest, VersionStats};
//!
//! let manifest = Manifest::seed("v1.0.0".parse().unwrap(), "Initial release", VersionStats::default());
//! assert!(manifest.validate().is_ok());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod content;
pub mod deploy;
pub mod directory;
pub mod error;
pub mod history;
pub mod jobs;
pub mod layout;
pub mod lease;
pub mod manifest;
pub mod paths;
pub mod remote;
pub mod source;
pub mod store;
pub mod tracker;

pub use content::{ContentManifest, FileDigest, IntegrityReport};
pub use deploy::{DeployConfig, DeploymentOrchestrator, DeploymentStatus, FailurePolicy};
pub use directory::{
    DirectorySeed, Instance, InstanceDirectory, InstanceRole, InstanceUser,
    StorageInstanceDirectory, import_seed,
};
pub use error::{ReleaseError, Result};
pub use history::{HistoryEntry, HistoryStatus, VersionHistoryLedger};
pub use jobs::{DeployStep, DeploymentJob, JobState, JobStore, StepStatus};
pub use layout::VersionLayout;
pub use manifest::{LastDeployed, Manifest, VersionEntry, VersionStats, VersionStatus};
pub use remote::{HttpManifestSource, RemoteManifestSource, StaticManifestSource};
pub use source::{GitSourceTree, LocalSourceTree, SourceSnapshot, SourceTree};
pub use store::ManifestStore;
pub use tracker::{InstanceVersionTracker, VersionChange};
