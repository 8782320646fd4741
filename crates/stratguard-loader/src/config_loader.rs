//! Loader for built-in records: a registered class plus JSON parameters.

use crate::builtin::StrategyRegistry;
use crate::cache::{CacheKey, CachedClass, LoaderKind, StrategyCache};
use crate::instance::LoadedStrategyInstance;
use crate::stage::{LoadFailure, LoadStage};
use crate::trail::LoadTrail;
use std::sync::Arc;
use stratguard_audit::AuditLogger;
use stratguard_core::{ExecutionLimits, Result, RiskLevel, StrategySourceRecord};

/// Instantiates trusted native classes with validated parameters.
///
/// Results are cached like compiled classes; the key never depends on the
/// sanitizer mode since parameter text is not sanitized.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    registry: Arc<StrategyRegistry>,
    audit: AuditLogger,
    cache: StrategyCache,
    limits: ExecutionLimits,
}

impl ConfigLoader {
    /// Creates a loader over `registry`.
    #[must_use]
    pub const fn new(
        registry: Arc<StrategyRegistry>,
        audit: AuditLogger,
        cache: StrategyCache,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            registry,
            audit,
            cache,
            limits,
        }
    }

    /// Registered classes.
    #[must_use]
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Validates the record's parameters and instantiates its class.
    ///
    /// # Errors
    ///
    /// - [`stratguard_core::Error::NotFound`] if the class is not registered
    /// - [`stratguard_core::Error::ValidationError`] on invalid parameters
    pub async fn load(&self, record: &StrategySourceRecord) -> Result<LoadedStrategyInstance> {
        let trail = LoadTrail::begin(
            &self.audit,
            record,
            record.content_hash(),
            LoaderKind::Config,
            true,
        );
        let key = CacheKey::new(
            trail.hash().clone(),
            record.declared_class_name(),
            true,
            LoaderKind::Config,
        );

        let registry = Arc::clone(&self.registry);
        let class_name = record.declared_class_name().to_string();
        let params = record.source_text().to_string();
        let result = self
            .cache
            .get_or_load(key, move || async move {
                let class = match registry
                    .get(&class_name)
                    .and_then(|registered| registered.instantiate(&params))
                {
                    Ok(class) => class,
                    Err(err) => return Err(LoadFailure::new(LoadStage::Hashed, err)),
                };
                tracing::info!(class = %class_name, "built-in strategy instantiated");
                Ok(CachedClass {
                    class,
                    risk_level: RiskLevel::Safe,
                    warnings: Vec::new(),
                })
            })
            .await;
        trail.finish(result, self.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratguard_audit::AuditEventType;
    use stratguard_core::{SourceType, StrategyId};

    fn loader(audit: &AuditLogger) -> ConfigLoader {
        ConfigLoader::new(
            Arc::new(StrategyRegistry::with_builtins()),
            audit.clone(),
            StrategyCache::new(16, Duration::from_secs(60), 2),
            ExecutionLimits::default(),
        )
    }

    fn record(class: &str, params: &str) -> StrategySourceRecord {
        StrategySourceRecord::new(StrategyId::new("b-1"), params, class, SourceType::Builtin)
    }

    #[tokio::test]
    async fn test_loads_registered_class() {
        let audit = AuditLogger::in_memory(64);
        let instance = loader(&audit)
            .load(&record("MovingAverageCross", r#"{"fast": 3, "slow": 9}"#))
            .await
            .unwrap();
        assert_eq!(instance.metadata().class_name, "MovingAverageCross");
        assert_eq!(instance.metadata().risk_level, RiskLevel::Safe);

        let types: Vec<_> = audit.events().iter().map(|e| e.event_type).collect();
        assert_eq!(types, [AuditEventType::LoadAttempt, AuditEventType::LoadSuccess]);
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_denied() {
        let audit = AuditLogger::in_memory(64);
        let err = loader(&audit)
            .load(&record("Momentum", r#"{"lookback": -4}"#))
            .await
            .unwrap_err();
        assert!(err.is_validation_error());

        let last = audit.events().pop().unwrap();
        assert_eq!(last.event_type, AuditEventType::LoadDenied);
        assert_eq!(last.outcome, "invalid_parameters");
    }

    #[tokio::test]
    async fn test_unregistered_class_is_not_found() {
        let audit = AuditLogger::in_memory(64);
        let err = loader(&audit)
            .load(&record("Martingale", "{}"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(audit.events().pop().unwrap().outcome, "class_not_registered");
    }

    #[tokio::test]
    async fn test_second_load_is_cache_hit() {
        let audit = AuditLogger::in_memory(64);
        let loader = loader(&audit);
        let record = record("Momentum", r#"{"lookback": 5}"#);
        let first = loader.load(&record).await.unwrap();
        let second = loader.load(&record).await.unwrap();
        assert!(Arc::ptr_eq(first.class(), second.class()));
        assert_eq!(audit.events().pop().unwrap().outcome, "cache_hit");
    }
}
