//! Shared test utilities for corehost tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording
//!   and failure injection
//! - [`SourceFixture`]: A temporary source checkout with per-version folders
//! - [`ManifestServer`]: A local HTTP server answering manifest fetches
//!
//! # Example
//!
//! ```rust,ignore
//! use corehost_test_utils::{ManifestServer, SourceFixture, manifest_json};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = ManifestServer::start(manifest_json("v1.1.0", &["v1.0.0", "v1.1.0"])).await;
//!     let source = SourceFixture::new().with_version("v1.1.0", &[("index.js", "1")]);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod manifest_server;
pub mod storage;

pub use fixtures::*;
pub use manifest_server::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("corehost=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
