//! Cache configuration

use std::env;
use std::path::PathBuf;

/// Default memory tier capacity: 64 MiB of decoded pixels
pub const DEFAULT_MEMORY_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default disk ceiling: 256 MiB of encoded files
pub const DEFAULT_MAX_DISK_USAGE: u64 = 256 * 1024 * 1024;

/// Configuration for an [`ImageCache`](crate::ImageCache)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCacheConfig {
    pub cache_dir: PathBuf,
    /// Capacity of the memory tier in decoded-image bytes.
    pub memory_capacity: u64,
    /// Ceiling for on-disk usage in bytes; zero disables disk persistence.
    pub max_disk_usage: u64,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/images"),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            max_disk_usage: DEFAULT_MAX_DISK_USAGE,
        }
    }
}

impl ImageCacheConfig {
    /// Parse configuration from environment variables
    ///
    /// - `IMAGE_CACHE_DIR`
    /// - `IMAGE_CACHE_MEMORY_BYTES`
    /// - `IMAGE_CACHE_MAX_DISK_BYTES` (zero or negative disables the disk tier)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let memory_capacity = env::var("IMAGE_CACHE_MEMORY_BYTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.memory_capacity);

        let max_disk_usage = env::var("IMAGE_CACHE_MAX_DISK_BYTES")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(disk_ceiling)
            .unwrap_or(defaults.max_disk_usage);

        Self {
            cache_dir,
            memory_capacity,
            max_disk_usage,
        }
    }
}

/// Map a signed ceiling onto bytes; zero or negative means "no disk".
pub fn disk_ceiling(bytes: i64) -> u64 {
    u64::try_from(bytes).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ImageCacheConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./cache/images"));
        assert_eq!(config.memory_capacity, 64 * 1024 * 1024);
        assert_eq!(config.max_disk_usage, 256 * 1024 * 1024);
    }

    #[test]
    fn test_disk_ceiling() {
        assert_eq!(disk_ceiling(1024), 1024);
        assert_eq!(disk_ceiling(0), 0);
        assert_eq!(disk_ceiling(-1), 0);
        assert_eq!(disk_ceiling(i64::MIN), 0);
    }
}
