//! HTTP manifest source against a local upstream.

use std::time::Duration;

use axum::http::StatusCode;
use corehost_release::{HttpManifestSource, ReleaseError, RemoteManifestSource};
use corehost_test_utils::{ManifestResponse, ManifestServer, manifest_json};

fn source(server: &ManifestServer, token: Option<&str>) -> HttpManifestSource {
    HttpManifestSource::new(server.url(), token.map(str::to_string), Duration::from_secs(5))
        .expect("valid url")
}

#[tokio::test]
async fn fetches_and_busts_caches() -> anyhow::Result<()> {
    let server = ManifestServer::start(manifest_json("v1.2.0", &["v1.0.0", "v1.1.0", "v1.2.0"])).await;
    let manifest = source(&server, Some("secret-token")).fetch_manifest().await?;

    assert_eq!(manifest.latest.as_str(), "v1.2.0");
    assert_eq!(manifest.versions.len(), 3);
    assert_eq!(manifest.versions[0].version.as_str(), "v1.2.0");

    let seen = server.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].uri.contains("t="), "{}", seen[0].uri);
    assert_eq!(seen[0].headers["cache-control"], "no-cache, no-store");
    assert_eq!(seen[0].headers["pragma"], "no-cache");
    assert_eq!(seen[0].headers["authorization"], "Bearer secret-token");
    Ok(())
}

#[tokio::test]
async fn anonymous_fetch_sends_no_credentials() -> anyhow::Result<()> {
    let server = ManifestServer::start(manifest_json("v1.0.0", &["v1.0.0"])).await;
    source(&server, None).fetch_manifest().await?;
    assert!(server.requests()[0].headers.get("authorization").is_none());
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_upstream_unavailable() {
    let server = ManifestServer::start_with(ManifestResponse::Status(StatusCode::BAD_GATEWAY)).await;
    let err = source(&server, None).fetch_manifest().await.unwrap_err();
    assert!(matches!(err, ReleaseError::UpstreamUnavailable { .. }), "{err}");
}

#[tokio::test]
async fn unreachable_upstream_is_upstream_unavailable() {
    // Reserve a port, then free it so nothing listens there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let url = format!("http://{addr}/manifest.json");
    let source = HttpManifestSource::new(url, None, Duration::from_secs(2)).expect("valid url");
    let err = source.fetch_manifest().await.unwrap_err();
    assert!(matches!(err, ReleaseError::UpstreamUnavailable { .. }), "{err}");
}

#[tokio::test]
async fn invalid_documents_are_malformed() {
    let server = ManifestServer::start_with(ManifestResponse::Raw("<html>oops</html>".into())).await;
    let http = source(&server, None);
    let err = http.fetch_manifest().await.unwrap_err();
    assert!(matches!(err, ReleaseError::MalformedResponse { .. }), "{err}");

    // Parses, but names a latest that no entry carries.
    let mut doc = manifest_json("v1.1.0", &["v1.0.0", "v1.1.0"]);
    doc["latest"] = "v1.0.0".into();
    server.set_response(ManifestResponse::Json(doc));
    let err = http.fetch_manifest().await.unwrap_err();
    assert!(matches!(err, ReleaseError::MalformedResponse { .. }), "{err}");
}
