//! Version registry routes.
//!
//! ## Routes
//!
//! - `GET    /versions/available` - List registered versions (public)
//! - `GET    /versions/core/{version}/{*path}` - Fetch one core file (public)
//! - `PUT    /versions/{version}/latest` - Mark a version latest
//! - `DELETE /versions/{version}` - Delete an unused, non-latest version
//! - `GET    /versions/{version}/verify` - Re-hash a version tree

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use corehost_release::{IntegrityReport, Manifest, VersionEntry, VersionStats};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

/// Size and usage figures for one version.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatsResponse {
    /// Instances currently running the version.
    pub instances_using: u64,
    /// Files in the version tree.
    pub file_count: u64,
    /// Total bytes in the version tree.
    pub size: u64,
}

impl From<VersionStats> for VersionStatsResponse {
    fn from(stats: VersionStats) -> Self {
        Self {
            instances_using: stats.instances_using,
            file_count: stats.file_count,
            size: stats.size,
        }
    }
}

/// One registered version.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    /// Version identifier.
    pub version: String,
    /// Release notes.
    pub description: String,
    /// `latest` or `stable`.
    pub status: String,
    /// Release timestamp.
    pub release_date: DateTime<Utc>,
    /// Size and usage figures.
    pub stats: VersionStatsResponse,
}

impl From<VersionEntry> for VersionResponse {
    fn from(entry: VersionEntry) -> Self {
        Self {
            version: entry.version.to_string(),
            description: entry.description,
            status: entry.status.to_string(),
            release_date: entry.release_date,
            stats: entry.stats.into(),
        }
    }
}

/// The version registry.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionListResponse {
    /// The latest version.
    pub latest: String,
    /// Registered versions, newest first.
    pub versions: Vec<VersionResponse>,
}

impl From<Manifest> for VersionListResponse {
    fn from(manifest: Manifest) -> Self {
        Self {
            latest: manifest.latest.to_string(),
            versions: manifest.versions.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of marking a version latest.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarkLatestResponse {
    /// Always true on success.
    pub success: bool,
    /// The version that is now latest.
    pub latest_version: String,
}

/// Result of deleting a version.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteVersionResponse {
    /// Always true on success.
    pub success: bool,
}

/// Integrity of a version tree against its content manifest.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyVersionResponse {
    /// The verified version.
    pub version: String,
    /// True when nothing is missing, changed, or extra.
    pub intact: bool,
    /// Files checked.
    pub checked: u64,
    /// Listed files absent on disk.
    pub missing: Vec<String>,
    /// Listed files whose content changed.
    pub mismatched: Vec<String>,
    /// Files on disk that are not listed.
    pub extra: Vec<String>,
}

impl VerifyVersionResponse {
    fn new(version: String, report: IntegrityReport) -> Self {
        Self {
            version,
            intact: report.is_intact(),
            checked: report.checked,
            missing: report.missing,
            mismatched: report.mismatched,
            extra: report.extra,
        }
    }
}

/// Unauthenticated version routes.
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/versions/available", get(list_versions))
        .route("/versions/core/:version/*path", get(get_core_file))
}

/// Authenticated version routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/versions/:version", delete(delete_version))
        .route("/versions/:version/latest", put(mark_latest))
        .route("/versions/:version/verify", get(verify_version))
}

/// List available versions.
///
/// GET /api/v1/versions/available
#[utoipa::path(
    get,
    path = "/api/v1/versions/available",
    tag = "versions",
    responses(
        (status = 200, description = "Registered versions", body = VersionListResponse),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn list_versions(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let manifest = state.orchestrator().list_versions().await?;
    Ok(Json(VersionListResponse::from(manifest)))
}

/// Fetch a raw core file.
///
/// GET /api/v1/versions/core/{version}/{path}
#[utoipa::path(
    get,
    path = "/api/v1/versions/core/{version}/{path}",
    tag = "versions",
    params(
        ("version" = String, Path, description = "Version identifier"),
        ("path" = String, Path, description = "File path inside the version tree")
    ),
    responses(
        (status = 200, description = "Raw file contents"),
        (status = 400, description = "Invalid version or path", body = ApiErrorBody),
        (status = 404, description = "Version or file not found", body = ApiErrorBody),
    )
)]
pub(crate) async fn get_core_file(
    State(state): State<Arc<AppState>>,
    Path((version, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let body = state.orchestrator().core_file(&version, &path).await?;
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&path)),
    );
    Ok(response)
}

/// Mark a version latest.
///
/// PUT /api/v1/versions/{version}/latest
#[utoipa::path(
    put,
    path = "/api/v1/versions/{version}/latest",
    tag = "versions",
    params(("version" = String, Path, description = "Version identifier")),
    responses(
        (status = 200, description = "Version is latest", body = MarkLatestResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 404, description = "Version not found", body = ApiErrorBody),
        (status = 409, description = "Registry changed concurrently", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn mark_latest(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    tracing::info!(version = %version, request_id = %ctx.request_id, "Marking version latest");

    let manifest = state
        .orchestrator()
        .mark_latest(&version)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(MarkLatestResponse {
        success: true,
        latest_version: manifest.latest.to_string(),
    }))
}

/// Delete a version.
///
/// DELETE /api/v1/versions/{version}
#[utoipa::path(
    delete,
    path = "/api/v1/versions/{version}",
    tag = "versions",
    params(("version" = String, Path, description = "Version identifier")),
    responses(
        (status = 200, description = "Version deleted", body = DeleteVersionResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 404, description = "Version not found", body = ApiErrorBody),
        (status = 422, description = "Version is latest or in use", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn delete_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    tracing::info!(version = %version, request_id = %ctx.request_id, "Deleting version");

    state
        .orchestrator()
        .delete_version(&version)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteVersionResponse { success: true }))
}

/// Verify a version tree.
///
/// GET /api/v1/versions/{version}/verify
#[utoipa::path(
    get,
    path = "/api/v1/versions/{version}/verify",
    tag = "versions",
    params(("version" = String, Path, description = "Version identifier")),
    responses(
        (status = 200, description = "Integrity report", body = VerifyVersionResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 404, description = "Version or content manifest not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn verify_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let report = state
        .orchestrator()
        .verify_version(&version)
        .await
        .map_err(|e| ctx.error(e))?;
    if !report.is_intact() {
        tracing::warn!(
            version = %version,
            missing = report.missing.len(),
            mismatched = report.mismatched.len(),
            extra = report.extra.len(),
            "version tree does not match its content manifest"
        );
    }
    Ok(Json(VerifyVersionResponse::new(version, report)))
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "js" | "mjs" => "application/javascript",
        "css" => "text/css; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("lib/app.JS"), "application/javascript");
        assert_eq!(content_type_for("styles/site.css"), "text/css; charset=utf-8");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }
}
