//! File-based image storage with a byte ceiling and LRU reclamation
//!
//! Every entry is one PNG file named `<key>.png` inside the cache directory.
//! Metadata (size, last access) and the usage ledger live in memory and are
//! rebuilt from a directory scan on open, so the ledger always matches what
//! is actually on disk even after an unclean shutdown.
//!
//! All mutations run under a single async write lock. The index itself sits
//! behind a short-lived std mutex so usage and membership can be read
//! without waiting for in-flight writes.

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::types::{CachedImage, DiskRecord, PersistOutcome, ReclaimSummary};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use std::collections::HashMap;
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

const EXTENSION: &str = "png";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Default)]
struct DiskIndex {
    records: HashMap<CacheKey, DiskRecord>,
    /// Ledger: sum of `size` over `records`
    total: u64,
}

impl DiskIndex {
    fn insert(&mut self, record: DiskRecord) {
        self.total += record.size;
        if let Some(old) = self.records.insert(record.key.clone(), record) {
            self.total -= old.size;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<DiskRecord> {
        let removed = self.records.remove(key);
        if let Some(record) = &removed {
            self.total -= record.size;
        }
        removed
    }

    fn clear(&mut self) {
        self.records.clear();
        self.total = 0;
    }

    /// Least recently accessed record, ties broken by smallest key.
    fn oldest(&self, exclude: Option<&CacheKey>) -> Option<&DiskRecord> {
        self.records
            .values()
            .filter(|r| Some(&r.key) != exclude)
            .min_by(|a, b| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.key.cmp(&b.key))
            })
    }
}

/// Size-bounded on-disk image store
pub struct DiskStore {
    dir: PathBuf,
    max_usage: AtomicU64,
    index: Mutex<DiskIndex>,
    write_lock: tokio::sync::Mutex<()>,
}

impl DiskStore {
    /// Open (or create) a store in `dir` with a ceiling of `max_usage` bytes.
    ///
    /// A ceiling of zero disables persistence and empties the directory.
    pub async fn open(dir: impl Into<PathBuf>, max_usage: u64) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            max_usage: AtomicU64::new(max_usage),
            index: Mutex::new(DiskIndex::default()),
            write_lock: tokio::sync::Mutex::new(()),
        };

        fs::create_dir_all(&store.dir).await?;
        let indexed = store.scan().await?;
        info!(
            cache_dir = ?store.dir,
            entries = indexed,
            usage = store.usage(),
            max_usage,
            "Disk cache opened"
        );

        if store.usage() > max_usage {
            let summary = store.reclaim(0).await?;
            info!(
                entries_removed = summary.entries_removed,
                bytes_freed = summary.bytes_freed,
                "Reclaimed disk cache down to ceiling"
            );
        }

        Ok(store)
    }

    /// Rebuild the index from the directory contents.
    async fn scan(&self) -> Result<usize> {
        let mut index = DiskIndex::default();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(TEMP_SUFFIX) {
                debug!(path = ?path, "Removing interrupted write");
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %e, "Failed to remove temp file");
                }
                continue;
            }

            let key = match name
                .strip_suffix(EXTENSION)
                .and_then(|s| s.strip_suffix('.'))
                .and_then(CacheKey::from_file_stem)
            {
                Some(key) => key,
                None => continue,
            };

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let last_access = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            index.insert(DiskRecord {
                key,
                path,
                size: metadata.len(),
                last_access,
            });
        }

        let count = index.records.len();
        *self.index() = index;
        Ok(count)
    }

    fn index(&self) -> MutexGuard<'_, DiskIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, key: &CacheKey) -> Option<DiskRecord> {
        self.index().records.get(key).cloned()
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, EXTENSION))
    }

    fn temp_path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}{}", key, EXTENSION, TEMP_SUFFIX))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ledger total in bytes (snapshot).
    pub fn usage(&self) -> u64 {
        self.index().total
    }

    pub fn max_usage(&self) -> u64 {
        self.max_usage.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_usage() > 0
    }

    pub fn entry_count(&self) -> usize {
        self.index().records.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index().records.contains_key(key)
    }

    /// All records, ordered by key.
    pub fn records(&self) -> Vec<DiskRecord> {
        let mut records: Vec<_> = self.index().records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Encode `image` as PNG and write it atomically under `key`.
    ///
    /// Reclaims least recently used entries first when the write would push
    /// usage over the ceiling.
    pub async fn persist(&self, key: &CacheKey, image: &CachedImage) -> Result<PersistOutcome> {
        if !self.is_enabled() {
            return Ok(PersistOutcome::Disabled);
        }

        let bytes = encode_png(image.clone()).await?;
        let size = bytes.len() as u64;

        let _guard = self.write_lock.lock().await;

        let limit = self.max_usage();
        if limit == 0 {
            return Ok(PersistOutcome::Disabled);
        }
        if size > limit {
            return Err(CacheError::DiskQuotaExceeded {
                required: size,
                limit,
            });
        }

        let existing = self.record(key).map(|r| r.size).unwrap_or(0);
        self.reclaim_locked(size.saturating_sub(existing), Some(key))
            .await?;

        if self.usage() - existing + size > limit {
            return Err(CacheError::DiskQuotaExceeded {
                required: size,
                limit,
            });
        }

        let path = self.path_for(key);
        let temp_path = self.temp_path_for(key);
        if let Err(e) = write_atomically(&temp_path, &path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        self.index().insert(DiskRecord {
            key: key.clone(),
            path,
            size,
            last_access: Utc::now(),
        });
        debug!(key = %key, size, usage = self.usage(), "Persisted image to disk");

        Ok(PersistOutcome::Written(size))
    }

    /// Read and decode the image stored under `key`.
    ///
    /// A missing file is a miss, not an error. An undecodable file is
    /// removed, unless it was rewritten while being read, and its decode
    /// error returned.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Option<DynamicImage>> {
        let record = match self.record(key) {
            Some(record) => record,
            None => return Ok(None),
        };

        let bytes = match fs::read(&record.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = %key, "Cached file vanished, dropping record");
                self.forget_if_missing(key).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let image = match decode_png(bytes).await {
            Ok(image) => image,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached file is corrupt, removing");
                self.remove_if_unchanged(&record).await?;
                return Err(e);
            }
        };

        self.touch(key, &record.path).await;
        debug!(key = %key, "Disk hit");
        Ok(Some(image))
    }

    /// Refresh recency in the index and, best-effort, the file mtime.
    async fn touch(&self, key: &CacheKey, path: &Path) {
        if let Some(record) = self.index().records.get_mut(key) {
            record.last_access = Utc::now();
        }

        let now = SystemTime::now();
        let result = async {
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            file.into_std().await.set_modified(now)
        }
        .await;
        if let Err(e) = result {
            debug!(key = %key, error = %e, "Failed to refresh file mtime");
        }
    }

    async fn forget_if_missing(&self, key: &CacheKey) {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        if !fs::try_exists(&path).await.unwrap_or(true) {
            self.index().remove(key);
        }
    }

    /// Delete the entry `seen` describes, unless it has since been replaced
    /// or touched.
    async fn remove_if_unchanged(&self, seen: &DiskRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let unchanged = self
            .record(&seen.key)
            .is_some_and(|r| r.size == seen.size && r.last_access == seen.last_access);
        if unchanged {
            self.remove_locked(&seen.key).await?;
        } else {
            debug!(key = %seen.key, "Entry rewritten since read, keeping it");
        }
        Ok(())
    }

    /// Delete the entry for `key`. Removing an absent key is a no-op.
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.remove_locked(key).await?;
        Ok(())
    }

    /// Returns the tracked size that was released, if the key was tracked.
    async fn remove_locked(&self, key: &CacheKey) -> Result<Option<u64>> {
        let record = self.index().remove(key);
        let path = record
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_else(|| self.path_for(key));

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                // The file is still there, so it still counts.
                if let Some(record) = record {
                    self.index().insert(record);
                }
                return Err(e.into());
            }
        }

        Ok(record.map(|r| r.size))
    }

    /// Delete every tracked file and reset the ledger.
    ///
    /// Safe to call when the directory no longer exists.
    pub async fn remove_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let records: Vec<DiskRecord> = {
            let mut index = self.index();
            let records = index.records.drain().map(|(_, r)| r).collect();
            index.total = 0;
            records
        };

        let mut removed = 0;
        let mut first_error = None;
        for record in records {
            match fs::remove_file(&record.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => removed += 1,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Failed to delete cached file");
                    self.index().insert(record);
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(removed, "Cleared disk cache");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Remove the whole cache directory and recreate it empty.
    ///
    /// Works regardless of the index state, so it doubles as the recovery
    /// path when the ledger and filesystem disagree.
    pub async fn clear_directory(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir).await?;
        self.index().clear();

        info!(cache_dir = ?self.dir, "Recreated empty cache directory");
        Ok(())
    }

    /// Evict least recently accessed entries until `target_free_bytes` fit
    /// under the ceiling, or nothing is left.
    pub async fn reclaim(&self, target_free_bytes: u64) -> Result<ReclaimSummary> {
        let _guard = self.write_lock.lock().await;
        self.reclaim_locked(target_free_bytes, None).await
    }

    async fn reclaim_locked(
        &self,
        target_free_bytes: u64,
        exclude: Option<&CacheKey>,
    ) -> Result<ReclaimSummary> {
        let limit = self.max_usage();
        let mut summary = ReclaimSummary::default();

        loop {
            let victim = {
                let index = self.index();
                if index.total.saturating_add(target_free_bytes) <= limit {
                    break;
                }
                match index.oldest(exclude) {
                    Some(record) => record.key.clone(),
                    None => break,
                }
            };

            if let Some(size) = self.remove_locked(&victim).await? {
                summary.entries_removed += 1;
                summary.bytes_freed += size;
                debug!(key = %victim, size, "Reclaimed disk entry");
            }
        }

        Ok(summary)
    }

    /// Change the ceiling, reclaiming immediately if usage is now above it.
    pub async fn set_max_usage(&self, max_usage: u64) -> Result<ReclaimSummary> {
        let _guard = self.write_lock.lock().await;
        self.max_usage.store(max_usage, Ordering::Relaxed);
        let summary = self.reclaim_locked(0, None).await?;
        info!(
            max_usage,
            entries_removed = summary.entries_removed,
            "Disk cache ceiling changed"
        );
        Ok(summary)
    }
}

async fn write_atomically(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(temp_path, bytes).await?;
    fs::rename(temp_path, path).await
}

async fn encode_png(image: CachedImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    })
    .await?
}

async fn decode_png(bytes: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || -> Result<DynamicImage> {
        Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?)
    })
    .await?
}
