//! Local HTTP server standing in for the upstream manifest authority.
//!
//! Serves one configurable response at `/manifest.json` and records the
//! requests it saw, so tests can assert on cache-busting and auth headers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::Value;
use tokio::sync::oneshot;

/// What the server answers with.
#[derive(Debug, Clone)]
pub enum ManifestResponse {
    /// `200 OK` with the JSON document.
    Json(Value),
    /// `200 OK` with a raw body.
    Raw(String),
    /// An empty response with the given status.
    Status(StatusCode),
}

/// One request the server received.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    /// Path and query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
}

#[derive(Clone, Default)]
struct ServerState {
    response: Arc<Mutex<Option<ManifestResponse>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// Manifest server bound to `127.0.0.1:0`.
pub struct ManifestServer {
    base_url: String,
    state: ServerState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for ManifestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestServer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ManifestServer {
    /// Starts a server answering every fetch with `manifest`.
    pub async fn start(manifest: Value) -> Self {
        Self::start_with(ManifestResponse::Json(manifest)).await
    }

    /// Starts a server with an arbitrary response.
    pub async fn start_with(response: ManifestResponse) -> Self {
        let state = ServerState::default();
        *state.response.lock().expect("lock") = Some(response);

        let app = Router::new()
            .route("/manifest.json", get(serve_manifest))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind manifest server");
        let addr: SocketAddr = listener.local_addr().expect("manifest server addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        }
    }

    /// URL of the manifest document.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}/manifest.json", self.base_url)
    }

    /// Replaces the response served from now on.
    pub fn set_response(&self, response: ManifestResponse) {
        *self.state.response.lock().expect("lock") = Some(response);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().expect("lock").clone()
    }
}

impl Drop for ManifestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_manifest(
    State(state): State<ServerState>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.seen.lock().expect("lock").push(SeenRequest {
        uri: uri.to_string(),
        headers,
    });
    let response = state.response.lock().expect("lock").clone();
    match response {
        Some(ManifestResponse::Json(body)) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response(),
        Some(ManifestResponse::Raw(body)) => (StatusCode::OK, body).into_response(),
        Some(ManifestResponse::Status(status)) => status.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
