//! `OpenAPI` specification generation for `corehost-api`.
//!
//! Served at `/openapi.json` for client generation.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// `OpenAPI` documentation for the corehost REST API (`/api/v1/*`).
#[derive(OpenApi)]
#[openapi(
    info(
        title = "corehost API",
        description = "Core version registry, deployments, and instance version tracking"
    ),
    paths(
        crate::routes::versions::list_versions,
        crate::routes::versions::get_core_file,
        crate::routes::versions::mark_latest,
        crate::routes::versions::delete_version,
        crate::routes::versions::verify_version,
        crate::routes::deployments::deployment_status,
        crate::routes::deployments::deploy_version,
        crate::routes::deployments::list_deployments,
        crate::routes::deployments::get_deployment,
        crate::routes::instances::get_instance_version,
        crate::routes::instances::update_instance_version,
        crate::routes::instances::rollback_instance_version,
        crate::routes::instances::instance_version_history,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::routes::versions::VersionStatsResponse,
            crate::routes::versions::VersionResponse,
            crate::routes::versions::VersionListResponse,
            crate::routes::versions::MarkLatestResponse,
            crate::routes::versions::DeleteVersionResponse,
            crate::routes::versions::VerifyVersionResponse,
            crate::routes::deployments::DeploymentStatusResponse,
            crate::routes::deployments::DeployRequest,
            crate::routes::deployments::DeployStepResponse,
            crate::routes::deployments::DeployAcceptedResponse,
            crate::routes::deployments::DeploymentJobResponse,
            crate::routes::deployments::ListDeploymentsResponse,
            crate::routes::instances::InstanceVersionResponse,
            crate::routes::instances::InstanceResponse,
            crate::routes::instances::UpdateVersionRequest,
            crate::routes::instances::VersionChangeResponse,
            crate::routes::instances::HistoryEntryResponse,
        )
    ),
    tags(
        (name = "versions", description = "Version registry and core files"),
        (name = "deployments", description = "Deploying versions from upstream"),
        (name = "instances", description = "Instance version updates and rollback"),
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearerAuth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Returns the generated `OpenAPI` spec.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Returns the generated `OpenAPI` spec serialized as pretty JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn openapi_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = openapi();
        for path in [
            "/api/v1/versions/available",
            "/api/v1/versions/core/{version}/{path}",
            "/api/v1/versions/{version}/latest",
            "/api/v1/versions/{version}",
            "/api/v1/versions/{version}/verify",
            "/api/v1/versions/deployment-status",
            "/api/v1/versions/deploy",
            "/api/v1/versions/deployments",
            "/api/v1/versions/deployments/{jobId}",
            "/api/v1/instances/{instanceId}/version",
            "/api/v1/instances/{instanceId}/version/rollback",
            "/api/v1/instances/{instanceId}/version/history",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn serializes_to_json() {
        let json = openapi_json().unwrap();
        assert!(json.contains("bearerAuth"));
    }
}
