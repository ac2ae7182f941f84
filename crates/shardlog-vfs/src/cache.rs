//! Per-file LRU cache of decrypted pages.
//!
//! The lock is held only for bookkeeping; decryption runs outside it, so two
//! threads missing on the same page may both compute it. The second insert
//! simply replaces the first.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of pages kept per open file.
pub const DEFAULT_CACHE_PAGES: usize = 100;

/// Hit/miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct LruState {
    /// page index -> (bytes, last-use tick)
    pages: HashMap<u64, (Arc<[u8]>, u64)>,
    /// last-use tick -> page index
    order: BTreeMap<u64, u64>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, index: u64) -> Option<Arc<[u8]>> {
        self.tick += 1;
        let tick = self.tick;
        let (bytes, last) = self.pages.get_mut(&index)?;
        self.order.remove(&*last);
        *last = tick;
        self.order.insert(tick, index);
        Some(Arc::clone(bytes))
    }

    fn insert(&mut self, index: u64, bytes: Arc<[u8]>, capacity: usize) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last)) = self.pages.insert(index, (bytes, tick)) {
            self.order.remove(&last);
        }
        self.order.insert(tick, index);

        while self.pages.len() > capacity {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            self.pages.remove(&victim);
        }
    }
}

/// Bounded, strictly least-recently-used page cache.
pub struct PageCache {
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached page, or compute and cache it.
    ///
    /// Errors from `compute` are returned as is and nothing is cached.
    pub fn get<E, F>(&self, index: u64, compute: F) -> std::result::Result<Arc<[u8]>, E>
    where
        F: FnOnce() -> std::result::Result<Vec<u8>, E>,
    {
        if let Some(bytes) = self.state.lock().touch(index) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let bytes: Arc<[u8]> = compute()?.into();
        self.state.lock().insert(index, Arc::clone(&bytes), self.capacity);
        Ok(bytes)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.state.lock().pages.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pages.clear();
        state.order.clear();
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_PAGES)
    }
}
