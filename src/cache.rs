//! A reference-counted cache keyed by `u64`.
//!
//! Every layer of the engine keeps its resident objects in a [`ReferenceCache`]: pages, data
//! items and MVCC entries. A `get` either hits a resident item and bumps its reference count,
//! or reserves a slot and runs [`CacheSource::load`] with the cache lock released, so misses on
//! different keys proceed in parallel. Concurrent misses on the same key wait for the first
//! loader by polling. When the last [`CacheHandle`] for a key is dropped the item is handed to
//! [`CacheSource::evict`] and removed.

use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::error::{Error, Result};

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Loads and evicts the objects held by a [`ReferenceCache`].
///
/// Both methods may be called from many threads at once.
pub trait CacheSource: Send + Sync {
    type Item: Send + Sync;

    /// Load the object for `key`. `Ok(None)` means nothing lives at `key`; no slot is taken.
    fn load(&self, key: u64) -> Result<Option<Self::Item>>;

    /// Called with the cache lock held once the last reference to `item` is released.
    fn evict(&self, item: &Self::Item);
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl CacheStats {
    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    #[cfg(test)]
    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct CacheState<T> {
    resident: HashMap<u64, Arc<T>>,
    refs: HashMap<u64, usize>,
    loading: HashSet<u64>,
    //  resident items plus slots reserved by in-flight loads
    count: usize,
}

pub struct ReferenceCache<S: CacheSource> {
    source: S,
    capacity: usize,
    state: Mutex<CacheState<S::Item>>,
    stats: CacheStats,
}

impl<S: CacheSource> ReferenceCache<S> {
    /// `capacity` bounds the number of resident items; 0 means unbounded.
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            capacity,
            state: Mutex::new(CacheState {
                resident: HashMap::new(),
                refs: HashMap::new(),
                loading: HashSet::new(),
                count: 0,
            }),
            stats: CacheStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of resident items, including slots reserved by loads in flight.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a handle to the item at `key`, loading it on a miss.
    ///
    /// Returns [`Error::CacheFull`] if every slot is taken and `Ok(None)` if the source has
    /// nothing at `key`.
    pub fn get(self: &Arc<Self>, key: u64) -> Result<Option<CacheHandle<S>>> {
        loop {
            let mut state = self.state.lock().unwrap();
            if state.loading.contains(&key) {
                drop(state);
                thread::sleep(LOAD_POLL_INTERVAL);
                continue;
            }

            if let Some(item) = state.resident.get(&key).cloned() {
                *state.refs.entry(key).or_insert(0) += 1;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(self.handle(key, item)));
            }

            if self.capacity > 0 && state.count >= self.capacity {
                return Err(Error::CacheFull);
            }
            state.count += 1;
            state.loading.insert(key);
            break;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let loaded = self.source.load(key);

        let mut state = self.state.lock().unwrap();
        state.loading.remove(&key);
        match loaded {
            Ok(Some(item)) => {
                let item = Arc::new(item);
                state.resident.insert(key, Arc::clone(&item));
                state.refs.insert(key, 1);
                Ok(Some(self.handle(key, item)))
            }
            Ok(None) => {
                state.count -= 1;
                Ok(None)
            }
            Err(e) => {
                state.count -= 1;
                Err(e)
            }
        }
    }

    fn handle(self: &Arc<Self>, key: u64, item: Arc<S::Item>) -> CacheHandle<S> {
        CacheHandle {
            cache: Arc::clone(self),
            key,
            item,
        }
    }

    /// Drop one reference to `key`. Keys that are no longer resident are ignored.
    fn release(&self, key: u64) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            let Some(refs) = state.refs.get_mut(&key) else {
                return;
            };
            *refs -= 1;
            if *refs > 0 {
                return;
            }
            state.refs.remove(&key);
            let evicted = state.resident.remove(&key);
            if let Some(item) = &evicted {
                self.source.evict(item);
            }
            state.count -= 1;
            evicted
        };
        //  the last Arc may own handles into other caches; drop it outside our lock
        drop(evicted);
    }

    /// Evict every resident item regardless of outstanding references.
    pub fn close(&self) {
        let evicted: Vec<Arc<S::Item>> = {
            let mut state = self.state.lock().unwrap();
            let keys: Vec<u64> = state.resident.keys().copied().collect();
            let mut evicted = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(item) = state.resident.remove(&key) {
                    self.source.evict(&item);
                    evicted.push(item);
                }
                state.refs.remove(&key);
                state.count -= 1;
            }
            evicted
        };
        drop(evicted);
    }
}

/// A counted reference to a cached item. Dropping it releases the reference.
pub struct CacheHandle<S: CacheSource> {
    cache: Arc<ReferenceCache<S>>,
    key: u64,
    item: Arc<S::Item>,
}

impl<S: CacheSource> CacheHandle<S> {
    /// Release the reference now instead of at end of scope.
    pub fn release(self) {
        drop(self)
    }
}

impl<S: CacheSource> Deref for CacheHandle<S> {
    type Target = S::Item;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<S: CacheSource> Drop for CacheHandle<S> {
    fn drop(&mut self) {
        self.cache.release(self.key);
    }
}

impl<S: CacheSource> Clone for CacheHandle<S> {
    /// Take another reference to the same item.
    fn clone(&self) -> Self {
        let mut state = self.cache.state.lock().unwrap();
        if let Some(refs) = state.refs.get_mut(&self.key) {
            *refs += 1;
        }
        drop(state);
        Self {
            cache: Arc::clone(&self.cache),
            key: self.key,
            item: Arc::clone(&self.item),
        }
    }
}
