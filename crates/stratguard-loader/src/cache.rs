//! Cache of validated strategy classes.
//!
//! Entries are spread over shards, each behind its own `RwLock`: lookups
//! take a shared lock on one shard, writes serialize per shard only. Each
//! entry expires after the configured TTL and each shard evicts its least
//! recently used entry under pressure.
//!
//! [`StrategyCache::get_or_load`] makes loading single-flight: concurrent
//! callers with the same uncached key await one detached load task, so a
//! caller that gives up does not cancel the work for the others.

use crate::stage::{LoadFailure, LoadStage};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use stratguard_core::traits::StrategyClass;
use stratguard_core::{ContentHash, Error, Result, RiskLevel};

/// Which loader produced a cached class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    /// Sanitized and compiled strategy code
    Dynamic,
    /// Registered native class with injected parameters
    Config,
}

impl LoaderKind {
    /// Label used in audit detail.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Config => "config",
        }
    }
}

/// Cache key: identical inputs under identical rules.
///
/// The class name is part of the key because one source may define several
/// classes, and the loader kind keeps a parameter text from ever aliasing
/// compiled code with the same digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: ContentHash,
    class_name: String,
    strict_mode: bool,
    kind: LoaderKind,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        hash: ContentHash,
        class_name: impl Into<String>,
        strict_mode: bool,
        kind: LoaderKind,
    ) -> Self {
        Self {
            hash,
            class_name: class_name.into(),
            strict_mode,
            kind,
        }
    }

    /// Digest of the source text.
    #[must_use]
    pub const fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Sanitizer mode the class was admitted under.
    #[must_use]
    pub const fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Loader that produced the class.
    #[must_use]
    pub const fn kind(&self) -> LoaderKind {
        self.kind
    }

    fn shard(&self, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        Hash::hash(self, &mut hasher);
        (hasher.finish() % shards as u64) as usize
    }
}

/// A validated class and the sanitizer verdict it was admitted with.
#[derive(Debug, Clone)]
pub struct CachedClass {
    /// Executable class
    pub class: Arc<dyn StrategyClass>,
    /// Risk level of the source
    pub risk_level: RiskLevel,
    /// Findings tolerated in lenient mode
    pub warnings: Vec<String>,
}

/// How a `get_or_load` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Found in the cache
    Hit,
    /// This caller ran the load
    Compiled,
    /// Joined a load started by another caller
    Shared,
}

impl CacheOutcome {
    /// Audit outcome label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache_hit",
            Self::Compiled => "compiled",
            Self::Shared => "shared",
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed (including expired entries)
    pub misses: u64,
    /// Entries dropped under LRU pressure
    pub evictions: u64,
    /// Entries dropped on TTL expiry
    pub expirations: u64,
    /// Loads that completed and were stored
    pub compilations: u64,
    /// Callers that joined an in-flight load
    pub shared_loads: u64,
    /// Current number of entries
    pub size: usize,
    /// Maximum number of entries
    pub capacity: usize,
}

impl CacheStats {
    /// Returns the hit rate (0.0 to 1.0), or `None` with no lookups.
    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        (total > 0).then(|| self.hits as f64 / total as f64)
    }
}

struct CacheEntry {
    value: CachedClass,
    inserted_at: Instant,
}

enum Lookup {
    Fresh(CachedClass),
    Expired,
    Missing,
}

type InflightLoad = Shared<BoxFuture<'static, std::result::Result<CachedClass, LoadFailure>>>;

struct Inner {
    shards: Vec<RwLock<LruCache<CacheKey, CacheEntry>>>,
    ttl: Duration,
    capacity: usize,
    inflight: Mutex<HashMap<CacheKey, InflightLoad>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    compilations: AtomicU64,
    shared_loads: AtomicU64,
}

fn poisoned() -> Error {
    Error::CacheError {
        message: "cache shard lock poisoned".to_string(),
    }
}

fn lock_inflight(inner: &Inner) -> MutexGuard<'_, HashMap<CacheKey, InflightLoad>> {
    inner
        .inflight
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Inner {
    fn shard(&self, key: &CacheKey) -> &RwLock<LruCache<CacheKey, CacheEntry>> {
        &self.shards[key.shard(self.shards.len())]
    }

    fn lookup(&self, key: &CacheKey, now: Instant) -> Result<Lookup> {
        let shard = self.shard(key);
        let lookup = {
            let guard = shard.read().map_err(|_| poisoned())?;
            match guard.peek(key) {
                Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                    Lookup::Fresh(entry.value.clone())
                }
                Some(_) => Lookup::Expired,
                None => Lookup::Missing,
            }
        };
        match &lookup {
            Lookup::Fresh(_) => {
                // Recency is refreshed opportunistically so readers never wait.
                if let Ok(mut guard) = shard.try_write() {
                    guard.promote(key);
                }
            }
            Lookup::Expired => {
                let mut guard = shard.write().map_err(|_| poisoned())?;
                let still_expired = guard
                    .peek(key)
                    .is_some_and(|entry| now.duration_since(entry.inserted_at) >= self.ttl);
                if still_expired {
                    guard.pop(key);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(hash = %key.hash, "cache entry expired");
                }
            }
            Lookup::Missing => {}
        }
        Ok(lookup)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CachedClass>> {
        match self.lookup(key, Instant::now())? {
            Lookup::Fresh(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Lookup::Expired | Lookup::Missing => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn insert(&self, key: CacheKey, value: CachedClass) -> Result<()> {
        let mut guard = self.shard(&key).write().map_err(|_| poisoned())?;
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = guard.push(key.clone(), entry)
            && evicted != key
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(hash = %evicted.hash, "cache entry evicted");
        }
        Ok(())
    }
}

/// Sharded TTL + LRU cache of validated classes.
///
/// Cloning is cheap and clones share the same entries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stratguard_loader::StrategyCache;
///
/// let cache = StrategyCache::new(128, Duration::from_secs(60), 8);
/// assert!(cache.is_empty());
/// assert_eq!(cache.stats().capacity, 128);
/// ```
#[derive(Clone)]
pub struct StrategyCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for StrategyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyCache")
            .field("shards", &self.inner.shards.len())
            .field("ttl", &self.inner.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl StrategyCache {
    /// Creates a cache of `capacity` entries (at least one per shard) split
    /// over `shards` shards.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shards = shards.clamp(1, capacity);
        // The first `capacity % shards` shards take one extra entry so the
        // shard capacities sum to exactly `capacity`.
        let (base, extra) = (capacity / shards, capacity % shards);
        Self {
            inner: Arc::new(Inner {
                shards: (0..shards)
                    .map(|i| {
                        let size = base + usize::from(i < extra);
                        RwLock::new(LruCache::new(
                            NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
                        ))
                    })
                    .collect(),
                ttl,
                capacity,
                inflight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
                compilations: AtomicU64::new(0),
                shared_loads: AtomicU64::new(0),
            }),
        }
    }

    /// Looks up a live entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the shard is unusable.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedClass>> {
        self.inner.get(key)
    }

    /// Stores an entry, evicting the shard's least recently used one when
    /// the shard is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the shard is unusable.
    pub fn insert(&self, key: CacheKey, value: CachedClass) -> Result<()> {
        self.inner.insert(key, value)
    }

    /// Returns the cached class for `key`, or runs `init` once for all
    /// concurrent callers and caches its success.
    ///
    /// Failures are not cached. If the cache itself is unusable the load
    /// runs uncached and a warning is logged.
    ///
    /// # Errors
    ///
    /// Returns the [`LoadFailure`] produced by `init`.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: CacheKey,
        init: F,
    ) -> std::result::Result<(CachedClass, CacheOutcome), LoadFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CachedClass, LoadFailure>> + Send + 'static,
    {
        match self.inner.get(&key) {
            Ok(Some(value)) => return Ok((value, CacheOutcome::Hit)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "strategy cache unavailable, loading uncached");
                return init().await.map(|value| (value, CacheOutcome::Compiled));
            }
        }

        let (load, outcome) = {
            let mut inflight = lock_inflight(&self.inner);
            // A load that finished after the miss above is already stored.
            if let Ok(Lookup::Fresh(value)) = self.inner.lookup(&key, Instant::now()) {
                return Ok((value, CacheOutcome::Hit));
            }
            if let Some(existing) = inflight.get(&key) {
                self.inner.shared_loads.fetch_add(1, Ordering::Relaxed);
                (existing.clone(), CacheOutcome::Shared)
            } else {
                let load = self.spawn_load(key.clone(), init());
                inflight.insert(key, load.clone());
                (load, CacheOutcome::Compiled)
            }
        };
        load.await.map(|value| (value, outcome))
    }

    fn spawn_load<Fut>(&self, key: CacheKey, load: Fut) -> InflightLoad
    where
        Fut: Future<Output = std::result::Result<CachedClass, LoadFailure>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = load.await;
            if let Ok(value) = &result {
                inner.compilations.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = inner.insert(key.clone(), value.clone()) {
                    tracing::warn!(error = %err, "failed to cache loaded strategy");
                }
            }
            lock_inflight(&inner).remove(&key);
            result
        });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(LoadFailure::new(
                    LoadStage::Received,
                    Error::RuntimeError {
                        message: format!("load task failed: {err}"),
                    },
                ))
            })
        }
        .boxed()
        .shared()
    }

    /// Removes one entry. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the shard is unusable.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let mut guard = self.inner.shard(key).write().map_err(|_| poisoned())?;
        Ok(guard.pop(key).is_some())
    }

    /// Removes every entry for a source digest, in any mode. Returns the
    /// number removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if a shard is unusable.
    pub fn invalidate_hash(&self, hash: &ContentHash) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.inner.shards {
            let mut guard = shard.write().map_err(|_| poisoned())?;
            let keys: Vec<CacheKey> = guard
                .iter()
                .filter(|(key, _)| key.hash == *hash)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                guard.pop(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(hash = %hash, removed, "cache entries invalidated");
        }
        Ok(removed)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        for shard in &self.inner.shards {
            if let Ok(mut guard) = shard.write() {
                guard.clear();
            }
        }
        tracing::info!("strategy cache cleared");
    }

    /// Number of entries, expired ones included until they are touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter_map(|shard| shard.read().ok().map(|guard| guard.len()))
            .sum()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poisons every shard lock so later lookups fail with a cache error.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        for index in 0..self.inner.shards.len() {
            let inner = Arc::clone(&self.inner);
            let _ = std::thread::spawn(move || {
                let _guard = inner.shards[index].write();
                panic!("poisoning cache shard {index}");
            })
            .join();
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            expirations: inner.expirations.load(Ordering::Relaxed),
            compilations: inner.compilations.load(Ordering::Relaxed),
            shared_loads: inner.shared_loads.load(Ordering::Relaxed),
            size: self.len(),
            capacity: inner.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use stratguard_core::{Invocation, MarketData, ResourceBudget, StrategyOp};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct Stub;

    #[async_trait]
    impl StrategyClass for Stub {
        fn class_name(&self) -> &str {
            "Stub"
        }

        fn operations(&self) -> &[StrategyOp] {
            &[StrategyOp::GenerateSignals]
        }

        fn verify_integrity(&self, _expected: &ContentHash) -> Result<()> {
            Ok(())
        }

        async fn invoke(
            &self,
            _op: StrategyOp,
            _data: Arc<MarketData>,
            _budget: ResourceBudget,
            _cancel: CancellationToken,
        ) -> Result<Invocation> {
            Err(Error::InvalidArgument("stub".into()))
        }
    }

    fn class() -> CachedClass {
        CachedClass {
            class: Arc::new(Stub),
            risk_level: RiskLevel::Safe,
            warnings: Vec::new(),
        }
    }

    fn key(text: &str) -> CacheKey {
        CacheKey::new(ContentHash::of(text), "Stub", true, LoaderKind::Dynamic)
    }

    #[test]
    fn test_key_mode_and_kind_are_distinct() {
        let hash = ContentHash::of("x");
        let strict = CacheKey::new(hash.clone(), "S", true, LoaderKind::Dynamic);
        let lenient = CacheKey::new(hash.clone(), "S", false, LoaderKind::Dynamic);
        let config = CacheKey::new(hash, "S", true, LoaderKind::Config);
        assert_ne!(strict, lenient);
        assert_ne!(strict, config);
    }

    #[test]
    fn test_insert_and_get() {
        let cache = StrategyCache::new(10, Duration::from_secs(60), 4);
        assert!(cache.get(&key("a")).unwrap().is_none());
        cache.insert(key("a"), class()).unwrap();
        assert!(cache.get(&key("a")).unwrap().is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate(), Some(0.5));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = StrategyCache::new(10, Duration::from_millis(20), 1);
        cache.insert(key("a"), class()).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key("a")).unwrap().is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_under_pressure() {
        let cache = StrategyCache::new(2, Duration::from_secs(60), 1);
        cache.insert(key("a"), class()).unwrap();
        cache.insert(key("b"), class()).unwrap();
        assert!(cache.get(&key("a")).unwrap().is_some());
        cache.insert(key("c"), class()).unwrap();

        assert!(cache.get(&key("a")).unwrap().is_some());
        assert!(cache.get(&key("b")).unwrap().is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_is_exact_across_shards() {
        for (capacity, shards) in [(10, 4), (7, 3), (5, 8), (1, 4)] {
            let cache = StrategyCache::new(capacity, Duration::from_secs(60), shards);
            for i in 0..500 {
                cache.insert(key(&format!("k{i}")), class()).unwrap();
            }
            let stats = cache.stats();
            assert_eq!(stats.capacity, capacity);
            assert!(stats.size <= capacity, "{capacity}/{shards}: {}", stats.size);
        }
    }

    #[test]
    fn test_invalidate_hash_covers_both_modes() {
        let cache = StrategyCache::new(10, Duration::from_secs(60), 4);
        let hash = ContentHash::of("src");
        for strict in [true, false] {
            cache
                .insert(
                    CacheKey::new(hash.clone(), "S", strict, LoaderKind::Dynamic),
                    class(),
                )
                .unwrap();
        }
        cache.insert(key("other"), class()).unwrap();
        assert_eq!(cache.invalidate_hash(&hash).unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_run_once() {
        let cache = StrategyCache::new(10, Duration::from_secs(60), 4);
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    cache
                        .get_or_load(key("same"), move || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(class())
                        })
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            let (_, outcome) = task.await.unwrap().unwrap();
            outcomes.push(outcome);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == CacheOutcome::Compiled)
                .count(),
            1
        );
        assert_eq!(cache.stats().compilations, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = StrategyCache::new(10, Duration::from_secs(60), 1);
        let failing = || async {
            Err(LoadFailure::new(
                LoadStage::Compiled,
                Error::CompilationError {
                    message: "bad".into(),
                    line: Some(1),
                },
            ))
        };
        assert!(cache.get_or_load(key("x"), failing).await.is_err());
        let (_, outcome) = cache
            .get_or_load(key("x"), || async { Ok(class()) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Compiled);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poisoned_cache_falls_back_to_uncached_load() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let cache = StrategyCache::new(4, Duration::from_secs(60), 2);
        cache.poison();
        assert!(cache.get(&key("a")).unwrap_err().is_cache_error());

        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            let (_, outcome) = cache
                .get_or_load(key("a"), move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(class())
                })
                .await
                .unwrap();
            assert_eq!(outcome, CacheOutcome::Compiled);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("loading uncached"), "{logs}");
    }

    #[tokio::test]
    async fn test_abandoned_load_still_completes() {
        let cache = StrategyCache::new(10, Duration::from_secs(60), 1);
        let load = cache.get_or_load(key("slow"), || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(class())
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(5), load)
                .await
                .is_err()
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&key("slow")).unwrap().is_some());
    }
}
