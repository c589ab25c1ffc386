//! Background disk worker
//!
//! One serial task per cache owns every disk mutation, so `store` never
//! waits on file I/O. Images waiting to be written sit in a pending table
//! keyed by cache key; the table is what a `Persist` job actually writes,
//! which lets repeated stores coalesce and lets invalidation withdraw a
//! write that has not happened yet. Removal and clearing are queued behind
//! earlier writes, so a queued write can never bring back an invalidated
//! entry.

use crate::disk::DiskStore;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::types::{CachedImage, PersistOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum DiskJob {
    Persist {
        key: CacheKey,
        reply: Option<oneshot::Sender<Result<PersistOutcome>>>,
    },
    Remove {
        key: CacheKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Clear {
        reply: oneshot::Sender<Result<()>>,
    },
    ClearDirectory {
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Images scheduled for persistence but not yet on disk
#[derive(Default)]
pub struct PendingWrites {
    images: Mutex<HashMap<CacheKey, CachedImage>>,
}

impl PendingWrites {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CachedImage>> {
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: CacheKey, image: CachedImage) {
        self.lock().insert(key, image);
    }

    fn withdraw(&self, key: &CacheKey) -> Option<CachedImage> {
        self.lock().remove(key)
    }

    fn withdraw_all(&self) {
        self.lock().clear();
    }

    /// Drop `key` once `written` is on disk, unless a newer image replaced it.
    fn complete(&self, key: &CacheKey, written: &CachedImage) {
        let mut images = self.lock();
        if images.get(key).is_some_and(|current| Arc::ptr_eq(current, written)) {
            images.remove(key);
        }
    }
}

/// Resolves to the outcome of one queued write
pub struct PersistReceipt(oneshot::Receiver<Result<PersistOutcome>>);

impl PersistReceipt {
    pub async fn outcome(self) -> Result<PersistOutcome> {
        self.0.await.map_err(|_| CacheError::WorkerStopped)?
    }
}

/// Handle to the serial disk worker of one cache instance
#[derive(Clone)]
pub struct DiskWriter {
    tx: mpsc::UnboundedSender<DiskJob>,
    pending: Arc<PendingWrites>,
    disk: Arc<DiskStore>,
    failures: Arc<AtomicU64>,
}

impl DiskWriter {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(disk: Arc<DiskStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingWrites::default());
        let failures = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_worker(
            rx,
            disk.clone(),
            pending.clone(),
            failures.clone(),
        ));

        Self {
            tx,
            pending,
            disk,
            failures,
        }
    }

    /// Queue `image` for persistence without waiting for the write.
    pub fn schedule(&self, key: CacheKey, image: CachedImage) {
        if !self.disk.is_enabled() {
            return;
        }
        self.pending.insert(key.clone(), image);
        if self.tx.send(DiskJob::Persist { key, reply: None }).is_err() {
            warn!("Disk worker stopped, write dropped");
        }
    }

    /// Queue `image` for persistence; the receipt resolves once it is written.
    ///
    /// The image is pending as soon as this returns, before the receipt is
    /// awaited.
    pub fn persist(&self, key: CacheKey, image: CachedImage) -> PersistReceipt {
        let (reply, rx) = oneshot::channel();
        if !self.disk.is_enabled() {
            let _ = reply.send(Ok(PersistOutcome::Disabled));
            return PersistReceipt(rx);
        }

        self.pending.insert(key.clone(), image);
        // On a stopped worker the reply sender is dropped with the job.
        let _ = self.tx.send(DiskJob::Persist {
            key,
            reply: Some(reply),
        });
        PersistReceipt(rx)
    }

    /// Make sure an image leaving memory is, or will be, on disk.
    ///
    /// Returns whether a write was queued. Never blocks.
    pub fn spill(&self, key: &CacheKey, image: &CachedImage) -> bool {
        if !self.disk.is_enabled() || self.pending.contains(key) || self.disk.contains(key) {
            return false;
        }
        debug!(key = %key, "Spilling evicted image to disk");
        self.schedule(key.clone(), image.clone());
        true
    }

    /// Image still waiting to be written, if any.
    pub fn pending(&self, key: &CacheKey) -> Option<CachedImage> {
        self.pending.get(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of background writes that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Withdraw any pending write for `key` and delete it from disk.
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.pending.withdraw(key);
        let (reply, rx) = oneshot::channel();
        self.send(DiskJob::Remove {
            key: key.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CacheError::WorkerStopped)?
    }

    /// Withdraw all pending writes and delete every disk entry.
    pub async fn clear(&self) -> Result<()> {
        self.pending.withdraw_all();
        let (reply, rx) = oneshot::channel();
        self.send(DiskJob::Clear { reply })?;
        rx.await.map_err(|_| CacheError::WorkerStopped)?
    }

    /// Withdraw all pending writes and recreate the cache directory.
    pub async fn clear_directory(&self) -> Result<()> {
        self.pending.withdraw_all();
        let (reply, rx) = oneshot::channel();
        self.send(DiskJob::ClearDirectory { reply })?;
        rx.await.map_err(|_| CacheError::WorkerStopped)?
    }

    /// Wait until every job queued before this call has finished.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(DiskJob::Flush { reply })?;
        rx.await.map_err(|_| CacheError::WorkerStopped)
    }

    fn send(&self, job: DiskJob) -> Result<()> {
        self.tx.send(job).map_err(|_| CacheError::WorkerStopped)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<DiskJob>,
    disk: Arc<DiskStore>,
    pending: Arc<PendingWrites>,
    failures: Arc<AtomicU64>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            DiskJob::Persist { key, reply } => {
                let result = match pending.get(&key) {
                    Some(image) => {
                        let result = disk.persist(&key, &image).await;
                        pending.complete(&key, &image);
                        result
                    }
                    None => Ok(PersistOutcome::Superseded),
                };

                if let Err(e) = &result {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Failed to persist image to disk");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            DiskJob::Remove { key, reply } => {
                let result = disk.remove(&key).await;
                if let Err(e) = &result {
                    warn!(key = %key, error = %e, "Failed to remove image from disk");
                }
                let _ = reply.send(result);
            }
            DiskJob::Clear { reply } => {
                let _ = reply.send(disk.remove_all().await.map(|_| ()));
            }
            DiskJob::ClearDirectory { reply } => {
                let _ = reply.send(disk.clear_directory().await);
            }
            DiskJob::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    debug!("Disk worker exiting");
}
