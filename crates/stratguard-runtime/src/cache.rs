//! Cache of compiled Wasmtime modules.
//!
//! Keyed by the BLAKE3 digest of the WASM bytes, so identical strategies
//! compiled from different records share one native module.
//!
//! # Examples
//!
//! ```
//! use stratguard_runtime::cache::ModuleCache;
//!
//! let cache = ModuleCache::new(10);
//! assert!(cache.is_empty());
//! assert_eq!(cache.capacity(), 10);
//! ```

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use stratguard_core::ContentHash;
use wasmtime::Module;

/// LRU cache of compiled modules with hit and miss counters.
pub struct ModuleCache {
    cache: Mutex<lru::LruCache<ContentHash, Module>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

impl ModuleCache {
    /// Creates a cache holding up to `capacity` modules (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, lru::LruCache<ContentHash, Module>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Looks up a module, refreshing its LRU position.
    #[must_use]
    pub fn get(&self, key: &ContentHash) -> Option<Module> {
        let found = self.lock().get(key).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Inserts a module, evicting the least recently used one when full.
    pub fn insert(&self, key: ContentHash, module: Module) {
        let mut cache = self.lock();
        tracing::debug!(key = %key, size = cache.len() + 1, "module cached");
        cache.put(key, module);
    }

    /// Whether `key` is cached. Does not touch LRU order or counters.
    #[must_use]
    pub fn contains(&self, key: &ContentHash) -> bool {
        self.lock().contains(key)
    }

    /// Drops every module.
    pub fn clear(&self) {
        self.lock().clear();
        tracing::info!("module cache cleared");
    }

    /// Number of cached modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of modules.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Lookups that found a module.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Config, Engine};

    fn module(engine: &Engine) -> Module {
        let wasm = wat::parse_str("(module)").unwrap();
        Module::new(engine, wasm).unwrap()
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        assert_eq!(ModuleCache::new(0).capacity(), 1);
    }

    #[test]
    fn test_insert_get_and_counters() {
        let cache = ModuleCache::new(5);
        let engine = Engine::new(&Config::default()).unwrap();
        let key = ContentHash::of_bytes(b"a");

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), module(&engine));
        assert!(cache.contains(&key));
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_get_refreshes_lru() {
        let cache = ModuleCache::new(2);
        let engine = Engine::new(&Config::default()).unwrap();
        let [k1, k2, k3] = [b"1", b"2", b"3"].map(|b| ContentHash::of_bytes(b));

        cache.insert(k1.clone(), module(&engine));
        cache.insert(k2.clone(), module(&engine));
        assert!(cache.get(&k1).is_some());
        cache.insert(k3.clone(), module(&engine));

        assert!(cache.contains(&k1));
        assert!(!cache.contains(&k2));
        assert!(cache.contains(&k3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let cache = ModuleCache::new(3);
        let engine = Engine::new(&Config::default()).unwrap();
        cache.insert(ContentHash::of_bytes(b"x"), module(&engine));
        cache.clear();
        assert!(cache.is_empty());
    }
}
