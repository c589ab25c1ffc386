//! Core types for the image cache proxy

use image_cache::{CacheStats, ImageCacheConfig};
use serde::{Deserialize, Serialize};

/// Configuration for the proxy service
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache: ImageCacheConfig,
    pub fetch_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            cache: ImageCacheConfig::default(),
            fetch_timeout_secs: 30,
        }
    }
}

/// `?url=` query for the image endpoints
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

/// Body of `PUT /admin/max-disk-usage`; zero or negative disables the disk tier
#[derive(Debug, Deserialize)]
pub struct MaxDiskUsageRequest {
    pub bytes: i64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
