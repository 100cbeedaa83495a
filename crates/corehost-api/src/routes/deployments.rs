//! Deployment routes.
//!
//! ## Routes
//!
//! - `GET  /versions/deployment-status` - Compare upstream with the local registry
//! - `POST /versions/deploy` - Start deploying a version (202)
//! - `GET  /versions/deployments` - List deployment jobs
//! - `GET  /versions/deployments/{jobId}` - Get one deployment job

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use corehost_core::JobId;
use corehost_release::{DeployStep, DeploymentJob, DeploymentStatus, ReleaseError, StepStatus};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody};
use crate::routes::versions::VersionResponse;
use crate::server::AppState;

/// Seconds a client should wait before retrying a deploy that conflicted.
const DEPLOY_RETRY_AFTER_SECS: u64 = 30;

/// Upstream versus local registry.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusResponse {
    /// True when upstream's latest differs from the local latest.
    pub has_new_version: bool,
    /// Upstream's latest version.
    pub remote_latest: String,
    /// The local latest version.
    pub local_latest: String,
    /// Every version upstream publishes.
    pub candidate_versions: Vec<VersionResponse>,
}

impl From<DeploymentStatus> for DeploymentStatusResponse {
    fn from(status: DeploymentStatus) -> Self {
        Self {
            has_new_version: status.has_new_version,
            remote_latest: status.remote_latest.to_string(),
            local_latest: status.local_latest.to_string(),
            candidate_versions: status
                .candidate_versions
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

/// Request to deploy a version.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Version to deploy, `v?MAJOR.MINOR.PATCH`.
    pub version_number: String,
    /// Release notes for the registry entry.
    #[serde(default)]
    pub description: String,
}

/// One step of a deployment.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeployStepResponse {
    /// 1-based position.
    pub step: u8,
    /// Step name.
    pub name: String,
    /// `pending`, `in_progress`, `completed`, or `failed`.
    pub status: String,
}

impl From<DeployStep> for DeployStepResponse {
    fn from(step: DeployStep) -> Self {
        let status = match step.status {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        Self {
            step: step.step,
            name: step.name,
            status: status.to_string(),
        }
    }
}

/// Immediate acknowledgement of an accepted deployment.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployAcceptedResponse {
    /// Always `deploying`.
    pub status: String,
    /// Job to poll for the outcome.
    pub job_id: String,
    /// Planned steps.
    pub steps: Vec<DeployStepResponse>,
}

/// A deployment job.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJobResponse {
    /// Job identifier.
    pub id: String,
    /// Version being deployed.
    pub version: String,
    /// Release notes.
    pub description: String,
    /// `queued`, `running`, `succeeded`, or `failed`.
    pub state: String,
    /// Step progress.
    pub steps: Vec<DeployStepResponse>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the worker started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<DeploymentJob> for DeploymentJobResponse {
    fn from(job: DeploymentJob) -> Self {
        Self {
            id: job.id.to_string(),
            version: job.version.to_string(),
            description: job.description,
            state: job.state.to_string(),
            steps: job.steps.into_iter().map(Into::into).collect(),
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// Deployment jobs, newest first.
#[derive(Debug, Serialize, ToSchema)]
pub struct ListDeploymentsResponse {
    /// Jobs.
    pub jobs: Vec<DeploymentJobResponse>,
}

/// Creates deployment routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/versions/deployment-status", get(deployment_status))
        .route("/versions/deploy", post(deploy_version))
        .route("/versions/deployments", get(list_deployments))
        .route("/versions/deployments/:job_id", get(get_deployment))
}

/// Check deployment status.
///
/// GET /api/v1/versions/deployment-status
#[utoipa::path(
    get,
    path = "/api/v1/versions/deployment-status",
    tag = "deployments",
    responses(
        (status = 200, description = "Upstream comparison", body = DeploymentStatusResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 502, description = "Upstream unavailable or malformed", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn deployment_status(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let status = state
        .orchestrator()
        .check_status()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeploymentStatusResponse::from(status)))
}

/// Deploy a version.
///
/// POST /api/v1/versions/deploy
#[utoipa::path(
    post,
    path = "/api/v1/versions/deploy",
    tag = "deployments",
    request_body = DeployRequest,
    responses(
        (status = 202, description = "Deployment accepted", body = DeployAcceptedResponse),
        (status = 400, description = "Malformed or duplicate version", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 409, description = "A deployment is already in progress", body = ApiErrorBody),
        (status = 502, description = "No upstream source configured", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn deploy_version(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let version = req.version_number.trim();
    if version.is_empty() {
        return Err(ctx.error(ApiError::bad_request("versionNumber is required")));
    }
    tracing::info!(version = %version, request_id = %ctx.request_id, "Deploy requested");

    let job = state
        .orchestrator()
        .start_deploy(version, req.description.trim())
        .await
        .map_err(|e| match e {
            ReleaseError::Conflict { message } => {
                ctx.error(ApiError::conflict_in_progress(message, DEPLOY_RETRY_AFTER_SECS))
            }
            other => ctx.error(other),
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployAcceptedResponse {
            status: "deploying".to_string(),
            job_id: job.id.to_string(),
            steps: job.steps.into_iter().map(Into::into).collect(),
        }),
    ))
}

/// List deployment jobs.
///
/// GET /api/v1/versions/deployments
#[utoipa::path(
    get,
    path = "/api/v1/versions/deployments",
    tag = "deployments",
    responses(
        (status = 200, description = "Deployment jobs", body = ListDeploymentsResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn list_deployments(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let jobs = state
        .orchestrator()
        .list_jobs()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListDeploymentsResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}

/// Get a deployment job.
///
/// GET /api/v1/versions/deployments/{jobId}
#[utoipa::path(
    get,
    path = "/api/v1/versions/deployments/{jobId}",
    tag = "deployments",
    params(("jobId" = String, Path, description = "Deployment job ID")),
    responses(
        (status = 200, description = "Deployment job", body = DeploymentJobResponse),
        (status = 400, description = "Malformed job ID", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
        (status = 404, description = "Job not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn get_deployment(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let job_id: JobId = job_id.parse().map_err(|e| ctx.error(ApiError::from(e)))?;
    let job = state
        .orchestrator()
        .get_job(&job_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeploymentJobResponse::from(job)))
}
