//! In-memory image tier with cost-bounded LRU eviction.
//!
//! Capacity is measured in decoded pixel bytes, not entry count. When an
//! insert pushes the total cost over capacity, least-recently-used entries
//! are chosen as victims and handed to the [`EvictionListener`] while they
//! are still in the map, so a concurrent reader never sees a gap between
//! eviction and spill. The listener runs without the map lock held; victims
//! are detached afterwards.

use crate::key::CacheKey;
use crate::types::{image_cost, CachedImage};
use lru::LruCache;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Receives entries evicted because of capacity pressure.
///
/// Called before the entry leaves the tier. Explicit removal (`remove`,
/// `remove_all`) is not an eviction and never reaches the listener.
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, key: &CacheKey, image: &CachedImage);
}

type Victims = Vec<(CacheKey, CachedImage)>;

struct Inner {
    entries: LruCache<CacheKey, CachedImage>,
    cost: u64,
    capacity: u64,
    /// Victims handed to the listener but not yet detached
    evicting: HashSet<CacheKey>,
    /// Cost of `evicting`
    draining: u64,
    evictions: u64,
}

impl Inner {
    /// Pick LRU entries, oldest first, until the tier would be back under
    /// capacity. Entries already being evicted are skipped.
    fn select_victims(&mut self) -> Victims {
        let mut excess = self
            .cost
            .saturating_sub(self.draining)
            .saturating_sub(self.capacity);
        let mut victims = Vec::new();

        for (key, image) in self.entries.iter().rev() {
            if excess == 0 {
                break;
            }
            if self.evicting.contains(key) {
                continue;
            }
            excess = excess.saturating_sub(image_cost(image));
            victims.push((key.clone(), image.clone()));
        }

        for (key, image) in &victims {
            self.evicting.insert(key.clone());
            self.draining += image_cost(image);
        }
        victims
    }

    /// Remove notified victims that are still present and still needed to
    /// get under capacity. Returns how many were removed.
    fn detach(&mut self, victims: Victims) -> usize {
        let mut detached = 0;
        for (key, image) in victims {
            let cost = image_cost(&image);
            self.evicting.remove(&key);
            self.draining = self.draining.saturating_sub(cost);

            // Replaced meanwhile, or removed explicitly
            let unchanged = self
                .entries
                .peek(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &image));
            if unchanged && self.cost > self.capacity {
                self.entries.pop(&key);
                self.cost = self.cost.saturating_sub(cost);
                self.evictions += 1;
                detached += 1;
            }
        }
        detached
    }
}

/// Bounded in-memory mapping from cache key to decoded image
pub struct MemoryTier {
    inner: Mutex<Inner>,
    listener: Option<Arc<dyn EvictionListener>>,
}

impl MemoryTier {
    /// Create a memory tier without an eviction listener.
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                cost: 0,
                capacity,
                evicting: HashSet::new(),
                draining: 0,
                evictions: 0,
            }),
            listener: None,
        }
    }

    /// Create a memory tier that reports every eviction to `listener`.
    pub fn with_listener(capacity: u64, listener: Arc<dyn EvictionListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new(capacity)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an image, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        self.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Insert or replace an image, evicting LRU entries if over capacity.
    ///
    /// Returns the number of entries evicted. An image costing more than the
    /// whole capacity is evicted itself once everything older is gone.
    pub fn put(&self, key: CacheKey, image: CachedImage) -> usize {
        self.put_if(key, image, || true).unwrap_or(0)
    }

    /// Like [`put`](Self::put), but only inserts if `admit` returns true.
    ///
    /// `admit` is evaluated under the tier lock, so a concurrent `remove`
    /// either sees the insert or happens before the check.
    pub fn put_if(
        &self,
        key: CacheKey,
        image: CachedImage,
        admit: impl FnOnce() -> bool,
    ) -> Option<usize> {
        {
            let mut inner = self.lock();
            if !admit() {
                return None;
            }
            inner.cost = inner.cost.saturating_add(image_cost(&image));
            if let Some((_key, replaced)) = inner.entries.push(key, image) {
                inner.cost = inner.cost.saturating_sub(image_cost(&replaced));
            }
        }

        Some(self.evict_over_capacity())
    }

    /// Remove an entry without notifying the listener.
    pub fn remove(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut inner = self.lock();
        let removed = inner.entries.pop(key);
        if let Some(image) = &removed {
            inner.cost = inner.cost.saturating_sub(image_cost(image));
        }
        removed
    }

    /// Drop every entry without notifying the listener.
    pub fn remove_all(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.cost = 0;
    }

    /// Change the capacity; lowering it evicts immediately.
    pub fn set_capacity(&self, capacity: u64) -> usize {
        self.lock().capacity = capacity;
        self.evict_over_capacity()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total decoded-image bytes currently held.
    pub fn cost(&self) -> u64 {
        self.lock().cost
    }

    pub fn capacity(&self) -> u64 {
        self.lock().capacity
    }

    /// Entries removed because of capacity pressure since creation.
    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    fn evict_over_capacity(&self) -> usize {
        let mut evicted = 0;
        loop {
            let victims = self.lock().select_victims();
            if victims.is_empty() {
                break;
            }

            for (key, image) in &victims {
                debug!(key = %key, cost = image_cost(image), "Evicting image from memory");
                if let Some(listener) = &self.listener {
                    listener.on_evict(key, image);
                }
            }

            let detached = self.lock().detach(victims);
            if detached == 0 {
                break;
            }
            evicted += detached;
        }
        evicted
    }
}
