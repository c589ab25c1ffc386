//! Two-tier image cache coordinator
//!
//! Reads go memory → pending writes → disk, promoting anything found below
//! the memory tier back into it. Writes land in memory immediately and reach
//! disk through the background worker. Memory evictions are spilled to disk
//! so capacity pressure alone never loses an image while disk space allows.

use crate::config::ImageCacheConfig;
use crate::disk::DiskStore;
use crate::error::Result;
use crate::key::{derive_key, derive_url_key, CacheKey, RequestDescriptor};
use crate::memory::{EvictionListener, MemoryTier};
use crate::types::{CacheStats, CacheTier, CachedImage, PersistOutcome, ReclaimSummary};
use crate::writer::DiskWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

/// Eviction handler: queues evicted images for disk before they leave memory.
struct SpillToDisk {
    writer: DiskWriter,
}

impl EvictionListener for SpillToDisk {
    fn on_evict(&self, key: &CacheKey, image: &CachedImage) {
        self.writer.spill(key, image);
    }
}

/// A cache hit and the tier that served it
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub image: CachedImage,
    pub tier: CacheTier,
}

/// Memory + disk cache for decoded images, keyed by request
pub struct ImageCache {
    memory: MemoryTier,
    disk: Arc<DiskStore>,
    writer: DiskWriter,
    counters: Counters,
    /// Bumped around every invalidation; promotions that started under an
    /// older value are dropped.
    invalidations: AtomicU64,
}

impl ImageCache {
    /// Open the disk tier (reconciling it with the directory contents) and
    /// start the background disk worker on the current tokio runtime.
    pub async fn open(config: ImageCacheConfig) -> Result<Self> {
        let disk = Arc::new(DiskStore::open(&config.cache_dir, config.max_disk_usage).await?);
        let writer = DiskWriter::spawn(disk.clone());
        let listener = Arc::new(SpillToDisk {
            writer: writer.clone(),
        });
        let memory = MemoryTier::with_listener(config.memory_capacity, listener);

        info!(
            cache_dir = ?config.cache_dir,
            memory_capacity = config.memory_capacity,
            max_disk_usage = config.max_disk_usage,
            "Image cache initialized"
        );

        Ok(Self {
            memory,
            disk,
            writer,
            counters: Counters::default(),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Return the cached image for `descriptor`, if any tier has it.
    pub async fn lookup(&self, descriptor: &RequestDescriptor) -> Result<Option<CachedImage>> {
        Ok(self.lookup_hit(descriptor).await?.map(|hit| hit.image))
    }

    /// Like [`lookup`](Self::lookup), also reporting which tier served the hit.
    pub async fn lookup_hit(&self, descriptor: &RequestDescriptor) -> Result<Option<CacheHit>> {
        let key = derive_key(descriptor)?;
        Ok(self.lookup_key(&key).await)
    }

    async fn lookup_key(&self, key: &CacheKey) -> Option<CacheHit> {
        let epoch = self.invalidations.load(Ordering::SeqCst);

        if let Some(image) = self.memory.get(key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Memory hit");
            return Some(CacheHit {
                image,
                tier: CacheTier::Memory,
            });
        }

        if let Some(image) = self.writer.pending(key) {
            self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Pending write hit");
            self.promote(key, &image, epoch);
            return Some(CacheHit {
                image,
                tier: CacheTier::Pending,
            });
        }

        match self.disk.fetch(key).await {
            Ok(Some(image)) => {
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                let image = Arc::new(image);
                self.promote(key, &image, epoch);
                return Some(CacheHit {
                    image,
                    tier: CacheTier::Disk,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Disk lookup failed, treating as miss");
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss");
        None
    }

    /// Copy a lower-tier hit into memory, unless an invalidation started
    /// since the lookup began.
    fn promote(&self, key: &CacheKey, image: &CachedImage, epoch: u64) {
        let admitted = self.memory.put_if(key.clone(), image.clone(), || {
            self.invalidations.load(Ordering::SeqCst) == epoch
        });
        if admitted.is_none() {
            debug!(key = %key, "Skipped promotion racing an invalidation");
        }
    }

    fn bump_invalidations(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    /// Insert into memory and queue the disk write; returns without waiting
    /// for disk.
    pub async fn store(
        &self,
        descriptor: &RequestDescriptor,
        image: impl Into<CachedImage>,
    ) -> Result<CacheKey> {
        let key = derive_key(descriptor)?;
        let image = image.into();

        // Pending first, so an immediate self-eviction is not queued twice.
        self.writer.schedule(key.clone(), image.clone());
        self.memory.put(key.clone(), image);

        debug!(key = %key, "Stored image");
        Ok(key)
    }

    /// Insert into memory and wait for the disk write.
    ///
    /// Disk failures (`DiskQuotaExceeded`, IO errors) are returned, but the
    /// memory entry stays valid regardless.
    pub async fn store_durable(
        &self,
        descriptor: &RequestDescriptor,
        image: impl Into<CachedImage>,
    ) -> Result<PersistOutcome> {
        let key = derive_key(descriptor)?;
        let image = image.into();

        let receipt = self.writer.persist(key.clone(), image.clone());
        self.memory.put(key, image);
        receipt.outcome().await
    }

    /// Remove `descriptor` from both tiers. Idempotent.
    pub async fn invalidate(&self, descriptor: &RequestDescriptor) -> Result<()> {
        let key = derive_key(descriptor)?;
        self.invalidate_key(&key).await;
        Ok(())
    }

    /// Remove the header-less entry for `url` from both tiers. Idempotent.
    pub async fn invalidate_url(&self, url: &str) -> Result<()> {
        let key = derive_url_key(url)?;
        self.invalidate_key(&key).await;
        Ok(())
    }

    async fn invalidate_key(&self, key: &CacheKey) {
        self.bump_invalidations();
        self.memory.remove(key);
        if let Err(e) = self.writer.remove(key).await {
            warn!(key = %key, error = %e, "Failed to invalidate disk entry");
        }
        // A lookup that read the file before it was deleted may have
        // promoted it in the meantime.
        self.bump_invalidations();
        self.memory.remove(key);
        debug!(key = %key, "Invalidated");
    }

    /// Empty both tiers.
    pub async fn clear_all(&self) {
        self.bump_invalidations();
        self.memory.remove_all();
        if let Err(e) = self.writer.clear().await {
            warn!(error = %e, "Failed to clear disk cache");
        }
        self.bump_invalidations();
        self.memory.remove_all();
        info!("Image cache cleared");
    }

    /// Empty memory and recreate the cache directory from scratch.
    ///
    /// Unlike [`clear_all`](Self::clear_all) this ignores the disk index, so
    /// it also recovers from a ledger that disagrees with the filesystem.
    pub async fn clear_cache_directory(&self) -> Result<()> {
        self.bump_invalidations();
        self.memory.remove_all();
        let result = self.writer.clear_directory().await;
        self.bump_invalidations();
        self.memory.remove_all();
        result
    }

    /// Drop the memory tier only (e.g. under memory pressure). Entries that
    /// are on disk or still pending stay retrievable.
    pub fn purge_memory(&self) {
        self.memory.remove_all();
        debug!("Purged memory tier");
    }

    /// Change the disk ceiling; lowering it below current usage reclaims
    /// immediately. Zero disables the disk tier.
    pub async fn set_max_disk_usage(&self, max_disk_usage: u64) -> Result<ReclaimSummary> {
        self.disk.set_max_usage(max_disk_usage).await
    }

    /// Resize the memory tier; entries pushed out spill to disk like any
    /// other eviction.
    pub fn set_memory_capacity(&self, capacity: u64) -> usize {
        self.memory.set_capacity(capacity)
    }

    pub fn max_disk_usage(&self) -> u64 {
        self.disk.max_usage()
    }

    /// Bytes currently on disk (snapshot of the ledger).
    pub fn disk_usage(&self) -> u64 {
        self.disk.usage()
    }

    /// Wait for all queued disk work to finish.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.cost(),
            memory_capacity: self.memory.capacity(),
            disk_entries: self.disk.entry_count(),
            disk_bytes: self.disk.usage(),
            max_disk_usage: self.disk.max_usage(),
            pending_writes: self.writer.pending_count(),
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.memory.evictions(),
            disk_failures: self.writer.failures(),
        }
    }
}
