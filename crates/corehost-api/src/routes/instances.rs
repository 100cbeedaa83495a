//! Instance version routes.
//!
//! ## Routes
//!
//! - `GET  /instances/{instanceId}/version` - Current version of an instance
//! - `PUT  /instances/{instanceId}/version` - Move an instance to a registered version
//! - `POST /instances/{instanceId}/version/rollback` - Undo the previous update
//! - `GET  /instances/{instanceId}/version/history` - Version changes, newest first

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use corehost_core::{InstanceId, VersionId};
use corehost_release::{HistoryEntry, Instance, VersionChange};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

/// Current version of an instance.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceVersionResponse {
    /// Instance identifier.
    pub instance_id: u64,
    /// The version the instance runs.
    pub current_version: String,
    /// Subdomain the instance is served on.
    pub subdomain: String,
}

/// An instance record.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    /// Instance identifier.
    pub id: u64,
    /// Owning client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    /// Subdomain the instance is served on.
    pub subdomain: String,
    /// The version the instance runs.
    pub core_version: String,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id.get(),
            client_id: instance.client_id,
            subdomain: instance.subdomain,
            core_version: instance.core_version.to_string(),
        }
    }
}

/// Request to move an instance to another version.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVersionRequest {
    /// A registered version.
    pub target_version: String,
}

/// Outcome of an update or rollback.
#[derive(Debug, Serialize, ToSchema)]
pub struct VersionChangeResponse {
    /// Always true on success.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// The instance after the change.
    pub instance: InstanceResponse,
}

impl From<VersionChange> for VersionChangeResponse {
    fn from(change: VersionChange) -> Self {
        Self {
            success: true,
            message: change.message,
            instance: change.instance.into(),
        }
    }
}

/// One version change of an instance.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    /// Entry identifier.
    pub id: String,
    /// Instance identifier.
    pub instance_id: u64,
    /// Version before the change.
    pub from_version: String,
    /// Version after the change.
    pub to_version: String,
    /// `pending`, `completed`, `rolled_back`, or `failed`.
    pub status: String,
    /// Free-form note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When the change was requested.
    pub created_at: DateTime<Utc>,
    /// When the change finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<HistoryEntry> for HistoryEntryResponse {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            instance_id: entry.instance_id.get(),
            from_version: entry.from_version.to_string(),
            to_version: entry.to_version.to_string(),
            status: entry.status.to_string(),
            notes: entry.notes,
            created_at: entry.created_at,
            completed_at: entry.completed_at,
        }
    }
}

/// Creates instance routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/instances/:instance_id/version",
            get(get_instance_version).put(update_instance_version),
        )
        .route(
            "/instances/:instance_id/version/rollback",
            post(rollback_instance_version),
        )
        .route(
            "/instances/:instance_id/version/history",
            get(instance_version_history),
        )
}

fn parse_instance_id(ctx: &RequestContext, raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse().map_err(|e: corehost_core::Error| ctx.error(e))
}

/// Get the current version of an instance.
///
/// GET /api/v1/instances/{instanceId}/version
#[utoipa::path(
    get,
    path = "/api/v1/instances/{instanceId}/version",
    tag = "instances",
    params(("instanceId" = u64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Current version", body = InstanceVersionResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Instance not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn get_instance_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&ctx, &instance_id)?;
    let instance = state
        .tracker()
        .get_current_version(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(InstanceVersionResponse {
        instance_id: instance.id.get(),
        current_version: instance.core_version.to_string(),
        subdomain: instance.subdomain,
    }))
}

/// Move an instance to another version.
///
/// PUT /api/v1/instances/{instanceId}/version
#[utoipa::path(
    put,
    path = "/api/v1/instances/{instanceId}/version",
    tag = "instances",
    params(("instanceId" = u64, Path, description = "Instance ID")),
    request_body = UpdateVersionRequest,
    responses(
        (status = 200, description = "Version updated", body = VersionChangeResponse),
        (status = 400, description = "Unknown or malformed version", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Not an admin of this instance", body = ApiErrorBody),
        (status = 404, description = "Instance not found", body = ApiErrorBody),
        (status = 409, description = "Instance is busy", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn update_instance_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateVersionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&ctx, &instance_id)?;
    let target: VersionId = req
        .target_version
        .trim()
        .parse()
        .map_err(|e: corehost_core::Error| ctx.error(e))?;
    tracing::info!(
        instance_id = %instance_id,
        target = %target,
        request_id = %ctx.request_id,
        "Updating instance version"
    );

    let change = state
        .tracker()
        .update_version(instance_id, &target, ctx.principal.instance_user_id())
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(VersionChangeResponse::from(change)))
}

/// Roll an instance back.
///
/// POST /api/v1/instances/{instanceId}/version/rollback
#[utoipa::path(
    post,
    path = "/api/v1/instances/{instanceId}/version/rollback",
    tag = "instances",
    params(("instanceId" = u64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Version rolled back", body = VersionChangeResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Not an admin of this instance", body = ApiErrorBody),
        (status = 404, description = "Instance not found", body = ApiErrorBody),
        (status = 409, description = "Instance is busy", body = ApiErrorBody),
        (status = 422, description = "No previous version to rollback to", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn rollback_instance_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&ctx, &instance_id)?;
    tracing::info!(instance_id = %instance_id, request_id = %ctx.request_id, "Rolling back instance version");

    let change = state
        .tracker()
        .rollback(instance_id, ctx.principal.instance_user_id())
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(VersionChangeResponse::from(change)))
}

/// Version history of an instance.
///
/// GET /api/v1/instances/{instanceId}/version/history
#[utoipa::path(
    get,
    path = "/api/v1/instances/{instanceId}/version/history",
    tag = "instances",
    params(("instanceId" = u64, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "History, newest first", body = [HistoryEntryResponse]),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Instance not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn instance_version_history(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&ctx, &instance_id)?;
    let history = state
        .tracker()
        .history(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    let body: Vec<HistoryEntryResponse> = history.into_iter().map(Into::into).collect();
    Ok(Json(body))
}
