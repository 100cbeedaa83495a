//! API server configuration.
//!
//! Every setting has a default; [`Config::from_env`] overrides them from
//! `COREHOST_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use corehost_core::error::{Error, Result};
use corehost_release::{DeployConfig, FailurePolicy};

/// How the source checkout is refreshed before a deploy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSync {
    /// Use the tree as it is on disk.
    #[default]
    None,
    /// Run `git pull --ff-only` in the checkout first.
    Git,
}

/// Configuration for the corehost API server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Optional shared secret required to access `/metrics`.
    ///
    /// When set, callers must provide either `X-Metrics-Secret: <secret>`
    /// or `Authorization: Bearer <secret>`.
    #[serde(default)]
    pub metrics_secret: Option<String>,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - principals come from `X-Principal-Kind` / `X-User-Id` headers
    /// - logs are pretty-printed
    /// - in-memory metadata storage is allowed
    ///
    /// When disabled, a verified bearer token is required on every
    /// authenticated route.
    pub debug: bool,

    /// Root directory holding `versions/<id>/` trees and, with the
    /// filesystem backend, the registry and records under `state/`.
    #[serde(default)]
    pub core_root: Option<PathBuf>,

    /// Upstream source and manifest settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Deployment settings.
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Optional JSON file with instances and instance users imported at startup.
    #[serde(default)]
    pub directory_seed: Option<PathBuf>,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// JWT authentication configuration (used when `debug` is false).
    #[serde(default)]
    pub jwt: JwtConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("http_port", &self.http_port)
            .field(
                "metrics_secret",
                &self.metrics_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("debug", &self.debug)
            .field("core_root", &self.core_root)
            .field("upstream", &self.upstream)
            .field("deploy", &self.deploy)
            .field("directory_seed", &self.directory_seed)
            .field("cors", &self.cors)
            .field("jwt", &self.jwt)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            metrics_secret: None,
            debug: false,
            core_root: None,
            upstream: UpstreamConfig::default(),
            deploy: DeploySettings::default(),
            directory_seed: None,
            cors: CorsConfig::default(),
            jwt: JwtConfig::default(),
        }
    }
}

/// Where published versions come from.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// URL of the upstream manifest document.
    #[serde(default)]
    pub manifest_url: Option<String>,
    /// Optional bearer token sent with manifest fetches.
    #[serde(default)]
    pub token: Option<String>,
    /// Local checkout of the upstream source tree.
    #[serde(default)]
    pub source_root: Option<PathBuf>,
    /// Folder inside the checkout holding one folder per version.
    pub source_versions_dir: PathBuf,
    /// How the checkout is refreshed before each deploy.
    #[serde(default)]
    pub source_sync: SourceSync,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("manifest_url", &self.manifest_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("source_root", &self.source_root)
            .field("source_versions_dir", &self.source_versions_dir)
            .field("source_sync", &self.source_sync)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            token: None,
            source_root: None,
            source_versions_dir: PathBuf::from("core/versions"),
            source_sync: SourceSync::None,
        }
    }
}

/// Deployment tuning and registry bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Timeout for remote fetches, source sync, and file materialization.
    pub operation_timeout_secs: u64,
    /// Partial-state handling when a deploy fails.
    #[serde(skip)]
    pub failure_policy: FailurePolicy,
    /// Lease on the deploy lock.
    pub lock_ttl_secs: u64,
    /// Version registered when no registry exists yet.
    pub seed_version: String,
    /// Description of the seed version.
    pub seed_description: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 30,
            failure_policy: FailurePolicy::Retain,
            lock_ttl_secs: 600,
            seed_version: "v1.0.0".to_string(),
            seed_description: "Initial release".to_string(),
        }
    }
}

impl DeploySettings {
    /// Timeout applied to each upstream or filesystem step.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Config {
    /// Orchestrator settings derived from this configuration.
    #[must_use]
    pub fn deploy_config(&self) -> DeployConfig {
        DeployConfig {
            lock_ttl: Duration::from_secs(self.deploy.lock_ttl_secs),
            operation_timeout: self.deploy.operation_timeout(),
            failure_policy: self.deploy.failure_policy,
            source_versions_dir: self.upstream.source_versions_dir.clone(),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Supported variables:
    /// - `COREHOST_HTTP_PORT`
    /// - `COREHOST_DEBUG`
    /// - `COREHOST_METRICS_SECRET`
    /// - `COREHOST_CORE_ROOT`
    /// - `COREHOST_SOURCE_ROOT`
    /// - `COREHOST_SOURCE_VERSIONS_DIR`
    /// - `COREHOST_SOURCE_SYNC` (`none` or `git`)
    /// - `COREHOST_REMOTE_MANIFEST_URL`
    /// - `COREHOST_REMOTE_TOKEN`
    /// - `COREHOST_OPERATION_TIMEOUT_SECS`
    /// - `COREHOST_DEPLOY_FAILURE_POLICY` (`retain` or `cleanup`)
    /// - `COREHOST_DEPLOY_LOCK_TTL_SECS`
    /// - `COREHOST_SEED_VERSION`
    /// - `COREHOST_SEED_DESCRIPTION`
    /// - `COREHOST_DIRECTORY_SEED`
    /// - `COREHOST_JWT_SECRET`
    /// - `COREHOST_JWT_ISSUER`
    /// - `COREHOST_JWT_AUDIENCE`
    /// - `COREHOST_JWT_USER_CLAIM`
    /// - `COREHOST_JWT_KIND_CLAIM`
    /// - `COREHOST_CORS_ALLOWED_ORIGINS`
    /// - `COREHOST_CORS_MAX_AGE_SECONDS`
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("COREHOST_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("COREHOST_DEBUG")? {
            config.debug = debug;
        }
        config.metrics_secret = env_string("COREHOST_METRICS_SECRET");
        config.core_root = env_string("COREHOST_CORE_ROOT").map(PathBuf::from);
        config.directory_seed = env_string("COREHOST_DIRECTORY_SEED").map(PathBuf::from);

        config.upstream.manifest_url = env_string("COREHOST_REMOTE_MANIFEST_URL");
        config.upstream.token = env_string("COREHOST_REMOTE_TOKEN");
        config.upstream.source_root = env_string("COREHOST_SOURCE_ROOT").map(PathBuf::from);
        if let Some(dir) = env_string("COREHOST_SOURCE_VERSIONS_DIR") {
            config.upstream.source_versions_dir = PathBuf::from(dir);
        }
        if let Some(sync) = env_string("COREHOST_SOURCE_SYNC") {
            config.upstream.source_sync = parse_source_sync("COREHOST_SOURCE_SYNC", &sync)?;
        }

        if let Some(secs) = env_u64("COREHOST_OPERATION_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "COREHOST_OPERATION_TIMEOUT_SECS must be greater than zero".to_string(),
                ));
            }
            config.deploy.operation_timeout_secs = secs;
        }
        if let Some(policy) = env_string("COREHOST_DEPLOY_FAILURE_POLICY") {
            config.deploy.failure_policy = policy.parse().map_err(|e| {
                Error::InvalidInput(format!("COREHOST_DEPLOY_FAILURE_POLICY: {e}"))
            })?;
        }
        if let Some(secs) = env_u64("COREHOST_DEPLOY_LOCK_TTL_SECS")? {
            config.deploy.lock_ttl_secs = secs;
        }
        if let Some(version) = env_string("COREHOST_SEED_VERSION") {
            config.deploy.seed_version = version;
        }
        if let Some(description) = env_string("COREHOST_SEED_DESCRIPTION") {
            config.deploy.seed_description = description;
        }

        if let Some(origins) = env_string("COREHOST_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("COREHOST_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        config.jwt.hs256_secret = env_string("COREHOST_JWT_SECRET");
        config.jwt.issuer = env_string("COREHOST_JWT_ISSUER");
        config.jwt.audience = env_string("COREHOST_JWT_AUDIENCE");
        if let Some(claim) = env_string("COREHOST_JWT_USER_CLAIM") {
            config.jwt.user_claim = claim;
        }
        if let Some(claim) = env_string("COREHOST_JWT_KIND_CLAIM") {
            config.jwt.kind_claim = claim;
        }

        Ok(config)
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (debug only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

/// JWT configuration for production authentication.
#[derive(Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default)]
    pub hs256_secret: Option<String>,

    /// Optional issuer (`iss`) to enforce.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Optional audience (`aud`) to enforce.
    #[serde(default)]
    pub audience: Option<String>,

    /// Claim name that contains the user identifier.
    #[serde(default = "default_user_claim")]
    pub user_claim: String,

    /// Claim name that contains the principal kind (`admin` or `instance_user`).
    #[serde(default = "default_kind_claim")]
    pub kind_claim: String,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field(
                "hs256_secret",
                &self.hs256_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("user_claim", &self.user_claim)
            .field("kind_claim", &self.kind_claim)
            .finish()
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            hs256_secret: None,
            issuer: None,
            audience: None,
            user_claim: default_user_claim(),
            kind_claim: default_kind_claim(),
        }
    }
}

fn default_user_claim() -> String {
    "sub".to_string()
}

fn default_kind_claim() -> String {
    "kind".to_string()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_source_sync(name: &str, value: &str) -> Result<SourceSync> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(SourceSync::None),
        "git" => Ok(SourceSync::Git),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be one of: none, git (got {value})"
        ))),
    }
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert!(!config.debug);
        assert_eq!(config.deploy.operation_timeout_secs, 30);
        assert_eq!(config.deploy.lock_ttl_secs, 600);
        assert_eq!(config.deploy.failure_policy, FailurePolicy::Retain);
        assert_eq!(config.deploy.seed_version, "v1.0.0");
        assert_eq!(config.upstream.source_versions_dir, PathBuf::from("core/versions"));
        assert_eq!(config.jwt.user_claim, "sub");
        assert_eq!(config.jwt.kind_claim, "kind");
        assert_eq!(config.cors.max_age_seconds, 3600);
    }

    #[test]
    fn deploy_config_carries_settings() {
        let mut config = Config::default();
        config.deploy.operation_timeout_secs = 5;
        config.deploy.failure_policy = FailurePolicy::Cleanup;
        config.upstream.source_versions_dir = PathBuf::from("releases");

        let deploy = config.deploy_config();
        assert_eq!(deploy.operation_timeout, Duration::from_secs(5));
        assert_eq!(deploy.lock_ttl, Duration::from_secs(600));
        assert_eq!(deploy.failure_policy, FailurePolicy::Cleanup);
        assert_eq!(deploy.source_versions_dir, PathBuf::from("releases"));
    }

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }

    #[test]
    fn parse_source_sync_accepts_known_modes() -> Result<()> {
        assert_eq!(parse_source_sync("TEST", "none")?, SourceSync::None);
        assert_eq!(parse_source_sync("TEST", "GIT")?, SourceSync::Git);
        Ok(())
    }

    #[test]
    fn parse_source_sync_rejects_unknown_mode() {
        let err = parse_source_sync("TEST", "rsync").unwrap_err();
        let Error::InvalidInput(message) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("TEST"));
        assert!(message.contains("rsync"));
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        assert_eq!(
            parse_cors_allowed_origins(" https://a.test , https://b.test,"),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );
        assert_eq!(parse_cors_allowed_origins("*"), vec!["*".to_string()]);
        assert!(parse_cors_allowed_origins("  ").is_empty());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = Config::default();
        config.metrics_secret = Some("metrics-secret".into());
        config.upstream.token = Some("upstream-token".into());
        config.jwt.hs256_secret = Some("jwt-secret".into());

        let dbg = format!("{config:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("metrics-secret"));
        assert!(!dbg.contains("upstream-token"));
        assert!(!dbg.contains("jwt-secret"));
    }
}
