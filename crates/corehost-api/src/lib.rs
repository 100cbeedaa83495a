//! # corehost-api
//!
//! HTTP composition layer for the corehost version deployment service.
//!
//! This crate provides the API surface, handling:
//!
//! - **Authentication**: console admins and instance users from bearer tokens
//! - **Routing**: version registry, deployment, and instance version endpoints
//! - **Startup**: registry bootstrap, directory seed import, job recovery
//! - **Observability**: Metrics, tracing, and health checks
//!
//! All version policy lives in `corehost-release`; handlers translate
//! requests and errors.
//!
//! ## Endpoints
//!
//! ```text
//! GET    /health                                       - Health check
//! GET    /ready                                        - Readiness check
//! GET    /metrics                                      - Prometheus metrics
//! GET    /openapi.json                                 - OpenAPI document
//! GET    /api/v1/versions/available                    - List versions
//! GET    /api/v1/versions/core/{version}/{*path}       - Raw core file
//! GET    /api/v1/versions/deployment-status            - Upstream comparison
//! POST   /api/v1/versions/deploy                       - Start a deployment
//! GET    /api/v1/versions/deployments[/{jobId}]        - Deployment jobs
//! PUT    /api/v1/versions/{version}/latest             - Mark latest
//! DELETE /api/v1/versions/{version}                    - Delete a version
//! GET    /api/v1/versions/{version}/verify             - Integrity check
//! GET    /api/v1/instances/{id}/version                - Instance version
//! PUT    /api/v1/instances/{id}/version                - Update version
//! POST   /api/v1/instances/{id}/version/rollback       - Rollback
//! GET    /api/v1/instances/{id}/version/history        - History
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use corehost_api::server::Server;
//!
//! let server = Server::builder()
//!     .http_port(8080)
//!     .core_root("/srv/corehost")
//!     .jwt_hs256_secret(secret)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::{Principal, RequestContext};
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
