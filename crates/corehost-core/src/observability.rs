//! Logging initialization and span helpers.
//!
//! Deployment and instance work runs inside spans created here so every
//! log line carries the version or instance it concerns.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
/// `RUST_LOG` controls levels and defaults to `info`.
///
/// # Example
///
/// ```rust
/// use corehost_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        // A subscriber installed elsewhere (tests) wins.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Creates a span for deployment orchestrator work on one version.
///
/// # Example
///
/// ```rust
/// use corehost_core::observability::deploy_span;
///
/// let span = deploy_span("materialize", "v1.2.0");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn deploy_span(operation: &str, version: &str) -> Span {
    tracing::info_span!("deploy", op = operation, version = version)
}

/// Creates a span for version changes on one instance.
#[must_use]
pub fn instance_span(operation: &str, instance_id: u64) -> Span {
    tracing::info_span!("instance", op = operation, instance_id = instance_id)
}
