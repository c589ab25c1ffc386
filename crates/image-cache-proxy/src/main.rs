//! Image Cache Proxy - serves remote images through a two-tier cache
//!
//! Images are fetched from their origin on first request, kept decoded in
//! memory and persisted as PNG on disk for subsequent requests.

mod error;
mod fetch;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::fetch::ImageFetcher;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use image_cache::{ImageCache, ImageCacheConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("image_cache_proxy=info".parse()?)
        .add_directive("image_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting image cache proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!(
        "Memory capacity: {} MB",
        config.cache.memory_capacity / (1024 * 1024)
    );
    info!(
        "Max disk usage: {} MB",
        config.cache.max_disk_usage / (1024 * 1024)
    );

    let cache = ImageCache::open(config.cache).await?;
    let fetcher = ImageFetcher::new(Duration::from_secs(config.fetch_timeout_secs))?;

    let state: SharedState = Arc::new(ServerState::new(cache, fetcher));

    start_server(state, config.port)
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

fn load_config() -> ProxyConfig {
    let defaults = ProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let fetch_timeout_secs = std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.fetch_timeout_secs);

    ProxyConfig {
        port,
        cache: ImageCacheConfig::from_env(),
        fetch_timeout_secs,
    }
}
