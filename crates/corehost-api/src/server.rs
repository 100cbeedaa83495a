//! API server implementation.
//!
//! Wires the deployment orchestrator and instance version tracker behind
//! the HTTP routes, and runs startup recovery before accepting traffic.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use corehost_core::{MemoryBackend, StorageBackend};
use corehost_release::{
    DeploymentOrchestrator, DirectorySeed, GitSourceTree, HttpManifestSource, InstanceDirectory,
    InstanceVersionTracker, LocalSourceTree, ReleaseError, RemoteManifestSource, Result,
    SourceTree, StorageInstanceDirectory, VersionLayout, import_seed,
};

use crate::config::{Config, CorsConfig, SourceSync};

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    storage: Arc<dyn StorageBackend>,
    orchestrator: Arc<DeploymentOrchestrator>,
    tracker: InstanceVersionTracker,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("orchestrator", &"<DeploymentOrchestrator>")
            .field("tracker", &"<InstanceVersionTracker>")
            .finish()
    }
}

impl AppState {
    /// Returns the storage backend.
    #[must_use]
    pub fn storage_backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.storage)
    }

    /// Returns the deployment orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<DeploymentOrchestrator> {
        &self.orchestrator
    }

    /// Returns the instance version tracker.
    #[must_use]
    pub fn tracker(&self) -> &InstanceVersionTracker {
        &self.tracker
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. Dependencies are not checked.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK once metadata storage answers.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check_key = "__corehost/ready-check";
    match state.storage.head(check_key).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("storage check failed: {e}")),
            }),
        ),
    }
}

async fn openapi_json() -> impl IntoResponse {
    Json(crate::openapi::openapi())
}

// ============================================================================
// Server
// ============================================================================

/// The corehost API server.
pub struct Server {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    remote: Option<Arc<dyn RemoteManifestSource>>,
    source: Option<Arc<dyn SourceTree>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("remote", &self.remote.is_some())
            .field("source", &self.source.is_some())
            .finish()
    }
}

impl Server {
    /// Creates a new server with an explicit storage backend.
    ///
    /// Upstream and source tree come from the configuration.
    #[must_use]
    pub fn with_storage_backend(config: Config, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            storage,
            remote: None,
            source: None,
        }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn core_root(&self) -> PathBuf {
        self.config
            .core_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("core"))
    }

    fn remote_source(&self) -> Result<Option<Arc<dyn RemoteManifestSource>>> {
        if let Some(remote) = &self.remote {
            return Ok(Some(Arc::clone(remote)));
        }
        let Some(url) = self.config.upstream.manifest_url.as_deref() else {
            tracing::warn!("COREHOST_REMOTE_MANIFEST_URL not set; deployment status is unavailable");
            return Ok(None);
        };
        let remote = HttpManifestSource::new(
            url,
            self.config.upstream.token.clone(),
            self.config.deploy.operation_timeout(),
        )?;
        Ok(Some(Arc::new(remote)))
    }

    fn source_tree(&self) -> Option<Arc<dyn SourceTree>> {
        if let Some(source) = &self.source {
            return Some(Arc::clone(source));
        }
        let root = self.config.upstream.source_root.clone()?;
        let timeout = self.config.deploy.operation_timeout();
        let source: Arc<dyn SourceTree> = match self.config.upstream.source_sync {
            SourceSync::None => Arc::new(LocalSourceTree::new(root, timeout)),
            SourceSync::Git => Arc::new(GitSourceTree::new(root, timeout)),
        };
        Some(source)
    }

    async fn load_directory_seed(&self, directory: &dyn InstanceDirectory) -> Result<()> {
        let Some(path) = self.config.directory_seed.as_ref() else {
            return Ok(());
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ReleaseError::io(format!("read {}", path.display()), e))?;
        let seed: DirectorySeed = serde_json::from_slice(&bytes).map_err(|e| {
            ReleaseError::validation(format!("invalid directory seed {}: {e}", path.display()))
        })?;
        import_seed(directory, &seed).await
    }

    /// Builds shared state and runs startup recovery: bootstrap the registry,
    /// import the directory seed, and fail jobs a previous process left behind.
    async fn build_state(&self) -> Result<Arc<AppState>> {
        let storage = Arc::clone(&self.storage);
        let directory = Arc::new(StorageInstanceDirectory::new(Arc::clone(&storage)));

        let mut orchestrator = DeploymentOrchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&directory) as Arc<dyn InstanceDirectory>,
            VersionLayout::new(self.core_root()),
            self.config.deploy_config(),
        );
        if let Some(remote) = self.remote_source()? {
            orchestrator = orchestrator.with_remote(remote);
        }
        if let Some(source) = self.source_tree() {
            orchestrator = orchestrator.with_source(source);
        }

        let created = orchestrator
            .bootstrap(
                &self.config.deploy.seed_version,
                &self.config.deploy.seed_description,
            )
            .await?;
        if created {
            tracing::info!(version = %self.config.deploy.seed_version, "bootstrapped version registry");
        }

        self.load_directory_seed(directory.as_ref()).await?;

        let interrupted = orchestrator.recover_interrupted().await?;
        for job in &interrupted {
            tracing::warn!(job_id = %job.id, version = %job.version, "marked interrupted deployment as failed");
        }

        let tracker = InstanceVersionTracker::new(
            Arc::clone(&storage),
            orchestrator.manifests().clone(),
            directory,
        );

        Ok(Arc::new(AppState {
            config: self.config.clone(),
            storage,
            orchestrator: Arc::new(orchestrator),
            tracker,
        }))
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self, state: Arc<AppState>) -> Router {
        let cors = self.build_cors_layer();

        let auth_layer =
            middleware::from_fn_with_state(Arc::clone(&state), crate::context::auth_middleware);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            // Health, ready, metrics, and docs (no auth required)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .route("/openapi.json", get(openapi_json))
            // Public version reads
            .nest("/api/v1", crate::routes::public_routes())
            // Authenticated routes
            .nest("/api/v1", crate::routes::api_v1_routes().layer(auth_layer))
            // Middleware (order matters): Metrics outermost for timing, then trace, then CORS.
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Builds the CORS layer from configuration.
    fn build_cors_layer(&self) -> CorsLayer {
        let cors_config = &self.config.cors;
        let cors = Self::build_cors_base(cors_config);
        Self::apply_cors_allowed_origins(cors, cors_config)
    }

    fn build_cors_base(cors_config: &CorsConfig) -> CorsLayer {
        CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static("x-principal-kind"),
                header::HeaderName::from_static("x-user-id"),
                header::HeaderName::from_static("x-request-id"),
            ])
            .expose_headers([
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::RETRY_AFTER,
                header::HeaderName::from_static("x-request-id"),
            ])
            .max_age(Duration::from_secs(cors_config.max_age_seconds))
    }

    fn parse_cors_origins(cors_config: &CorsConfig) -> Vec<HeaderValue> {
        let mut allowed = Vec::new();
        for origin in &cors_config.allowed_origins {
            match HeaderValue::from_str(origin) {
                Ok(value) => allowed.push(value),
                Err(_) => {
                    tracing::error!(
                        origin = %origin,
                        "Invalid CORS origin; expected a valid HeaderValue"
                    );
                }
            }
        }
        allowed
    }

    fn apply_cors_allowed_origins(cors: CorsLayer, cors_config: &CorsConfig) -> CorsLayer {
        if cors_config.allowed_origins.is_empty() {
            return cors;
        }

        if cors_config.allowed_origins == ["*"] {
            return cors.allow_origin(Any);
        }

        if cors_config.allowed_origins.iter().any(|origin| origin == "*") {
            tracing::error!(
                origins = ?cors_config.allowed_origins,
                "Invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }

        let allowed = Self::parse_cors_origins(cors_config);
        if allowed.is_empty() {
            tracing::warn!("All configured CORS origins were invalid; disabling CORS");
            cors
        } else {
            tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
            cors.allow_origin(AllowOrigin::list(allowed))
        }
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unsafe for production,
    /// startup recovery fails, or the port cannot be bound.
    pub async fn serve(&self) -> Result<()> {
        self.validate_config()?;

        crate::metrics::init_metrics();

        let state = self.build_state().await?;
        let router = self.create_router(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));

        tracing::info!(
            http_port = self.config.http_port,
            core_root = %self.core_root().display(),
            "Starting corehost API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ReleaseError::io(format!("failed to bind to {addr}"), e))?;

        axum::serve(listener, router)
            .await
            .map_err(|e| ReleaseError::internal(format!("server error: {e}")))?;

        Ok(())
    }

    /// Creates a router after running startup recovery, without binding a port.
    ///
    /// Intended for integration tests.
    ///
    /// # Errors
    ///
    /// Returns an error if startup recovery fails.
    #[doc(hidden)]
    pub async fn test_router(&self) -> Result<Router> {
        let state = self.build_state().await?;
        Ok(self.create_router(state))
    }

    fn validate_config(&self) -> Result<()> {
        if self.config.debug {
            return Ok(());
        }

        if self.config.cors.allowed_origins.iter().any(|origin| origin == "*") {
            return Err(ReleaseError::validation(
                "cors.allowed_origins cannot include '*' when debug=false",
            ));
        }
        if self.config.core_root.is_none() {
            return Err(ReleaseError::validation(
                "COREHOST_CORE_ROOT is required when debug=false",
            ));
        }
        if self.config.jwt.hs256_secret.is_none() {
            return Err(ReleaseError::validation(
                "COREHOST_JWT_SECRET is required when debug=false",
            ));
        }
        Ok(())
    }
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    remote: Option<Arc<dyn RemoteManifestSource>>,
    source: Option<Arc<dyn SourceTree>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .finish_non_exhaustive()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            storage: Arc::new(MemoryBackend::new()),
            remote: None,
            source: None,
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    ///
    /// See `Config::debug` for behavior changes (header principals vs bearer tokens).
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the JWT HS256 secret used for bearer token verification.
    #[must_use]
    pub fn jwt_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt.hs256_secret = Some(secret.into());
        self
    }

    /// Sets the directory holding version trees.
    #[must_use]
    pub fn core_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.core_root = Some(root.into());
        self
    }

    /// Sets the storage backend for registry and records.
    ///
    /// By default, the server uses an in-memory backend intended only for tests/dev.
    #[must_use]
    pub fn storage_backend(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    /// Overrides the upstream manifest source.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteManifestSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Overrides the upstream source tree.
    #[must_use]
    pub fn source_tree(mut self, source: Arc<dyn SourceTree>) -> Self {
        self.source = Some(source);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            storage: self.storage,
            remote: self.remote,
            source: self.source,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
