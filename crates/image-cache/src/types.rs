//! Cache types

use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A decoded image shared between the memory tier, pending writes and callers
pub type CachedImage = Arc<DynamicImage>;

/// Memory cost of a decoded image: the size of its pixel buffer
pub fn image_cost(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}

/// Metadata for a file in the disk tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: DateTime<Utc>,
}

/// Result of a disk write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistOutcome {
    /// The entry is on disk and occupies this many bytes.
    Written(u64),
    /// Disk persistence is disabled (ceiling of zero); nothing was written.
    Disabled,
    /// Nothing left to write: an earlier write already took the latest
    /// image for this key, or the key was invalidated first.
    Superseded,
}

/// Which tier served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    /// Queued for disk but not yet written
    Pending,
    Disk,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Pending => "pending",
            CacheTier::Disk => "disk",
        }
    }
}

/// What a reclamation pass deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimSummary {
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

/// Statistics about both cache tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_capacity: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub max_disk_usage: u64,
    pub pending_writes: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disk_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::derive_url_key;
    use image::RgbaImage;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_bytes, 0);
        assert_eq!(stats.memory_hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_image_cost_is_pixel_buffer_size() {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(10, 20));
        assert_eq!(image_cost(&image), 10 * 20 * 4);
    }

    #[test]
    fn test_disk_record_serialization() {
        let key = derive_url_key("https://img.example/a.png").unwrap();
        let record = DiskRecord {
            key: key.clone(),
            path: PathBuf::from(format!("/cache/{}.png", key)),
            size: 12345,
            last_access: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(key.as_str()));
        assert!(json.contains("12345"));

        let deserialized: DiskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.key, key);
        assert_eq!(deserialized.size, record.size);
    }

    #[test]
    fn test_invalid_key_rejected_on_deserialize() {
        let result: std::result::Result<CacheKey, _> = serde_json::from_str("\"../etc/passwd\"");
        assert!(result.is_err());
    }
}
