//! Entry point: fetches records and dispatches them to the right loader.

use crate::builtin::StrategyRegistry;
use crate::cache::{CacheStats, StrategyCache};
use crate::config_loader::ConfigLoader;
use crate::dynamic::DynamicCodeLoader;
use crate::instance::LoadedStrategyInstance;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use stratguard_audit::{AuditEvent, AuditEventType, AuditLogger};
use stratguard_core::traits::SourceStore;
use stratguard_core::{Error, GuardConfig, Result, SourceType, StrategyId, StrategySourceRecord};

/// Outcome of [`LoaderFactory::batch_load`].
#[derive(Debug, Default)]
pub struct BatchLoad {
    /// Instances in request order
    pub loaded: Vec<LoadedStrategyInstance>,
    /// Ids that failed, in request order
    pub failed: Vec<(StrategyId, Error)>,
}

/// Loads strategies by id: `builtin` records through the [`ConfigLoader`],
/// `ai` and `custom` records through the [`DynamicCodeLoader`]. Both share
/// one cache and one audit logger.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use stratguard_core::traits::SourceStore;
/// use stratguard_core::{GuardConfig, SourceType, StrategyId};
/// use stratguard_loader::LoaderFactory;
///
/// # async fn demo(store: Arc<dyn SourceStore>) -> stratguard_core::Result<()> {
/// let factory = LoaderFactory::new(&GuardConfig::default(), store)?;
/// let instance = factory.load(SourceType::Ai, &StrategyId::new("breakout-7")).await?;
/// println!("{:?}", instance.metadata().warnings);
/// # Ok(())
/// # }
/// ```
pub struct LoaderFactory {
    store: Arc<dyn SourceStore>,
    dynamic: DynamicCodeLoader,
    config: ConfigLoader,
    cache: StrategyCache,
    audit: AuditLogger,
    strict_mode: bool,
}

impl fmt::Debug for LoaderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderFactory")
            .field("strict_mode", &self.strict_mode)
            .field("cache", &self.cache)
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

impl LoaderFactory {
    /// Creates a factory with the built-in class registry. The audit log is
    /// written to `config.audit_log_path` when set, memory only otherwise.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigError`] if `config` is invalid
    /// - [`Error::RuntimeError`] if the sandbox engine cannot start
    pub fn new(config: &GuardConfig, store: Arc<dyn SourceStore>) -> Result<Self> {
        let audit = match &config.audit_log_path {
            Some(path) => AuditLogger::with_file(path, config.audit_buffer_capacity),
            None => AuditLogger::in_memory(config.audit_buffer_capacity),
        };
        Self::with_parts(config, store, StrategyRegistry::with_builtins(), audit)
    }

    /// Creates a factory from explicit parts.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_parts(
        config: &GuardConfig,
        store: Arc<dyn SourceStore>,
        registry: StrategyRegistry,
        audit: AuditLogger,
    ) -> Result<Self> {
        config.validate()?;
        let cache = StrategyCache::new(
            config.max_cache_size,
            config.cache_ttl(),
            config.cache_shards,
        );
        let dynamic = DynamicCodeLoader::new(config, audit.clone(), cache.clone())?;
        let config_loader = ConfigLoader::new(
            Arc::new(registry),
            audit.clone(),
            cache.clone(),
            config.limits(),
        );
        tracing::info!(
            strict_mode = config.strict_mode,
            cache_capacity = config.max_cache_size,
            cache_ttl_seconds = config.cache_ttl_seconds,
            "loader factory ready"
        );
        Ok(Self {
            store,
            dynamic,
            config: config_loader,
            cache,
            audit,
            strict_mode: config.strict_mode,
        })
    }

    /// Sanitizer mode applied to dynamic loads.
    #[must_use]
    pub const fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Shared audit logger.
    #[must_use]
    pub const fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Shared cache.
    #[must_use]
    pub const fn cache(&self) -> &StrategyCache {
        &self.cache
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Loader used for `ai` and `custom` records.
    #[must_use]
    pub const fn dynamic_loader(&self) -> &DynamicCodeLoader {
        &self.dynamic
    }

    /// Fetches `id` and loads it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the store has no such record
    /// - [`Error::InvalidArgument`] if the record is not of `source_type`
    /// - any load error from the dispatched loader
    pub async fn load(
        &self,
        source_type: SourceType,
        id: &StrategyId,
    ) -> Result<LoadedStrategyInstance> {
        let record = match self.store.fetch(id).await {
            Ok(record) => record,
            Err(err) => return Err(self.unavailable(id, source_type, err)),
        };
        self.load_fetched(source_type, &record).await
    }

    /// Loads an already fetched record, dispatching on its source type.
    ///
    /// # Errors
    ///
    /// Any load error from the dispatched loader.
    pub async fn load_record(
        &self,
        record: &StrategySourceRecord,
    ) -> Result<LoadedStrategyInstance> {
        match record.source_type() {
            SourceType::Builtin => self.config.load(record).await,
            SourceType::Ai | SourceType::Custom => {
                self.dynamic.load(record, self.strict_mode).await
            }
        }
    }

    async fn load_fetched(
        &self,
        source_type: SourceType,
        record: &StrategySourceRecord,
    ) -> Result<LoadedStrategyInstance> {
        if record.source_type() != source_type {
            let err = Error::InvalidArgument(format!(
                "record '{}' has source type {}, requested {source_type}",
                record.id(),
                record.source_type()
            ));
            return Err(self.unavailable(record.id(), source_type, err));
        }
        self.load_record(record).await
    }

    /// Records a load that never reached a loader and returns `err`.
    fn unavailable(&self, id: &StrategyId, source_type: SourceType, err: Error) -> Error {
        self.audit.record(
            AuditEvent::new(AuditEventType::LoadAttempt, id.as_str(), "received")
                .with_detail("source_type", source_type.as_str()),
        );
        let outcome = if err.is_not_found() {
            "record_not_found"
        } else {
            "record_unusable"
        };
        self.audit.record(
            AuditEvent::new(AuditEventType::LoadDenied, id.as_str(), outcome)
                .with_detail("error", err.to_string()),
        );
        err
    }

    /// Fetches all `ids` in one store call, then loads them concurrently.
    ///
    /// Per-id failures are collected, not propagated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the batch fetch itself fails.
    pub async fn batch_load(
        &self,
        source_type: SourceType,
        ids: &[StrategyId],
    ) -> Result<BatchLoad> {
        let records = self.store.fetch_many(ids).await?;
        tracing::debug!(requested = ids.len(), found = records.len(), "batch fetched");

        let records = &records;
        let results = join_all(ids.iter().map(|id| async move {
            match records.get(id) {
                Some(record) => self.load_fetched(source_type, record).await,
                None => Err(self.unavailable(
                    id,
                    source_type,
                    Error::NotFound {
                        resource: id.to_string(),
                    },
                )),
            }
        }))
        .await;

        let mut batch = BatchLoad::default();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(instance) => batch.loaded.push(instance),
                Err(err) => batch.failed.push((id.clone(), err)),
            }
        }
        tracing::info!(
            loaded = batch.loaded.len(),
            failed = batch.failed.len(),
            "batch load finished"
        );
        Ok(batch)
    }

    /// Drops cached classes for the current source of `id` and loads it
    /// again through the full pipeline.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub async fn reload(&self, id: &StrategyId) -> Result<LoadedStrategyInstance> {
        let record = self.store.fetch(id).await?;
        match self.cache.invalidate_hash(&record.content_hash()) {
            Ok(removed) => tracing::debug!(strategy = %id, removed, "reload invalidated cache"),
            Err(err) => tracing::warn!(strategy = %id, error = %err, "cache invalidation failed"),
        }
        self.load_record(&record).await
    }

    /// Re-fetches the record behind `instance` and checks that the store
    /// still holds the source it was loaded from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityError`] if the stored source changed or
    /// the instance's retained source no longer matches.
    pub async fn verify(&self, instance: &LoadedStrategyInstance) -> Result<()> {
        let metadata = instance.metadata();
        let record = self.store.fetch(&metadata.strategy_id).await?;
        let stored = record.content_hash();
        if !stored.verify(&metadata.code_hash) {
            tracing::error!(
                strategy = %metadata.strategy_id,
                expected = %metadata.code_hash,
                actual = %stored,
                "stored strategy source was substituted"
            );
            return Err(Error::IntegrityError {
                expected: metadata.code_hash.to_string(),
                actual: stored.to_string(),
            });
        }
        instance.class().verify_integrity(&stored)
    }
}
