use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tandem_collab::server::{ServerConfig, SyncServer};

/// Build the server config from `TANDEM_*` environment variables.
fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("TANDEM_STORAGE_PATH") {
        config.storage_path = Some(PathBuf::from(path));
    }
    if let Some(secs) = env_u64("TANDEM_PRESENCE_TTL_SECS") {
        config.presence_ttl = Duration::from_secs(secs);
    }
    if let Some(bytes) = env_u64("TANDEM_MAX_CONTENT_BYTES") {
        config.max_content_bytes = Some(bytes as usize);
    }
    config
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring {name}={raw}: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    info!(
        "Starting tandem sync server on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("storage at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = Arc::new(SyncServer::new(config)?);
    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            signal.shutdown();
        }
    });
    server.run().await
}
