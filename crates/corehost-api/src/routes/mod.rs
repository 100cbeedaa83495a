//! HTTP route handlers.

pub mod deployments;
pub mod instances;
pub mod versions;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// `/api/v1` routes served without authentication.
pub fn public_routes() -> Router<Arc<AppState>> {
    versions::public_routes()
}

/// `/api/v1` routes (authenticated).
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(versions::routes())
        .merge(deployments::routes())
        .merge(instances::routes())
}
