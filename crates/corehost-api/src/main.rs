//! `corehost-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use corehost_api::config::Config;
use corehost_api::server::Server;
use corehost_core::observability::{LogFormat, init_logging};
use corehost_core::storage::{LocalFsBackend, MemoryBackend, StorageBackend};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    init_logging(choose_log_format(&config));

    let storage: Arc<dyn StorageBackend> = if let Some(root) = config.core_root.as_ref() {
        let state_root = root.join("state");
        tracing::info!(root = %state_root.display(), "Using filesystem metadata backend");
        Arc::new(LocalFsBackend::new(state_root)?)
    } else {
        if !config.debug {
            anyhow::bail!("COREHOST_CORE_ROOT is required when COREHOST_DEBUG=false");
        }
        tracing::warn!("COREHOST_CORE_ROOT not set; using in-memory metadata backend (debug only)");
        Arc::new(MemoryBackend::new())
    };

    let server = Server::with_storage_backend(config, storage);
    server.serve().await?;
    Ok(())
}
