//! The upstream authority that publishes available versions.
//!
//! The upstream may sit behind a CDN, so every fetch adds a cache-busting
//! query parameter and `no-cache` headers.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};

use crate::error::{ReleaseError, Result};
use crate::manifest::Manifest;

/// Source of the upstream version registry.
#[async_trait]
pub trait RemoteManifestSource: Send + Sync + 'static {
    /// Fetches the upstream registry. Has no local side effects.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::UpstreamUnavailable`] on transport failure or a
    /// non-success status, and [`ReleaseError::MalformedResponse`] if the body
    /// is not a valid registry.
    async fn fetch_manifest(&self) -> Result<Manifest>;
}

/// Fetches the registry document over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpManifestSource {
    /// Creates a source for `url`. Requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] if the URL is not absolute HTTP(S),
    /// or [`ReleaseError::Internal`] if the client cannot be built.
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| ReleaseError::validation(format!("invalid manifest URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ReleaseError::validation(format!(
                "manifest URL must be http or https: {url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReleaseError::internal(format!("build http client: {e}")))?;
        Ok(Self { client, url, token })
    }

    /// Returns the configured URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteManifestSource for HttpManifestSource {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        let bust = chrono::Utc::now().timestamp_millis().to_string();
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("t", bust.as_str())])
            .header(CACHE_CONTROL, "no-cache, no-store")
            .header(PRAGMA, "no-cache");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReleaseError::upstream(format!("manifest fetch timed out: {e}"))
            } else {
                ReleaseError::upstream(format!("manifest fetch failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::upstream(format!(
                "manifest fetch returned HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ReleaseError::upstream(format!("manifest body read failed: {e}")))?;
        let manifest = Manifest::from_remote_bytes(&body)?;
        tracing::debug!(latest = %manifest.latest, versions = manifest.versions.len(), "fetched upstream manifest");
        Ok(manifest)
    }
}

/// A fixed upstream answer, for tests and offline development.
#[derive(Debug, Default)]
pub struct StaticManifestSource {
    manifest: Mutex<Option<Manifest>>,
}

impl StaticManifestSource {
    /// Serves `manifest` on every fetch.
    #[must_use]
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Mutex::new(Some(manifest)),
        }
    }

    /// A source whose every fetch fails with `UpstreamUnavailable`.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Replaces the served manifest. `None` makes fetches fail.
    pub fn set(&self, manifest: Option<Manifest>) {
        if let Ok(mut guard) = self.manifest.lock() {
            *guard = manifest;
        }
    }
}

#[async_trait]
impl RemoteManifestSource for StaticManifestSource {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        self.manifest
            .lock()
            .map_err(|_| ReleaseError::internal("static source lock poisoned"))?
            .clone()
            .ok_or_else(|| ReleaseError::upstream("upstream is unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        let err = HttpManifestSource::new("ftp://x/manifest.json", None, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Validation { .. }));
        assert!(HttpManifestSource::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn static_source_can_go_unavailable() {
        let manifest = Manifest::seed(
            "v1.0.0".parse().unwrap(),
            "Initial release",
            crate::manifest::VersionStats::default(),
        );
        let source = StaticManifestSource::new(manifest);
        assert!(source.fetch_manifest().await.is_ok());
        source.set(None);
        let err = source.fetch_manifest().await.unwrap_err();
        assert!(matches!(err, ReleaseError::UpstreamUnavailable { .. }));
    }
}
