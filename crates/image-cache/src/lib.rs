//! Two-tier cache for remotely fetched images
//!
//! Decoded images are held in a byte-bounded LRU memory tier and persisted
//! as PNG files in a size-bounded disk tier. Entries are keyed by a SHA-256
//! digest of the normalized request (URL plus sorted headers). Disk writes
//! run on a background worker; images evicted from memory are spilled to
//! disk, and disk hits are promoted back into memory.

mod cache;
mod config;
mod disk;
mod error;
mod key;
mod memory;
mod types;
mod writer;

pub use cache::{CacheHit, ImageCache};
pub use config::{disk_ceiling, ImageCacheConfig, DEFAULT_MAX_DISK_USAGE, DEFAULT_MEMORY_CAPACITY};
pub use disk::DiskStore;
pub use error::{CacheError, Result};
pub use key::{derive_key, derive_url_key, CacheKey, RequestDescriptor};
pub use memory::{EvictionListener, MemoryTier};
pub use types::{
    image_cost, CacheStats, CacheTier, CachedImage, DiskRecord, PersistOutcome, ReclaimSummary,
};
