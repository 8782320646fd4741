//! Loader for untrusted strategy code.
//!
//! One load walks `Received -> Hashed -> Sanitized`, then either stops at
//! `Rejected` or continues through `NamespaceBuilt -> Compiled ->
//! ClassValidated -> Ready`. Everything after the cache lookup runs on the
//! blocking pool inside the single-flight task; see [`StrategyCache`].

use crate::cache::{CacheKey, CachedClass, LoaderKind, StrategyCache};
use crate::instance::LoadedStrategyInstance;
use crate::stage::{LoadFailure, LoadStage};
use crate::trail::LoadTrail;
use std::sync::Arc;
use stratguard_audit::AuditLogger;
use stratguard_core::{
    Error, ExecutionLimits, GuardConfig, Result, StrategyContract, StrategySourceRecord,
};
use stratguard_runtime::{
    PermissionChecker, PermissionPolicy, Sandbox, SandboxConfig, WasmStrategy, codegen,
};
use stratguard_script::CodeSanitizer;

/// Shared, read-only parts of the pipeline.
#[derive(Debug, Clone)]
struct Pipeline {
    sanitizer: Arc<CodeSanitizer>,
    permissions: PermissionChecker,
    contract: Arc<StrategyContract>,
    sandbox: Arc<Sandbox>,
}

impl Pipeline {
    fn run(
        &self,
        source: Arc<str>,
        class_name: &str,
        strict_mode: bool,
    ) -> std::result::Result<CachedClass, LoadFailure> {
        let analysis = self.sanitizer.inspect(&source, strict_mode);
        let report = analysis.report;
        tracing::debug!(
            class = class_name,
            stage = %LoadStage::Sanitized,
            risk = %report.risk_level(),
            "sanitizer verdict"
        );
        if !report.admits() {
            return Err(LoadFailure::new(
                LoadStage::Rejected,
                Error::SecurityViolation {
                    reason: format!("strategy code rejected: {}", report.summary()),
                    report: Some(Box::new(report)),
                },
            ));
        }
        let Some(module) = analysis.module else {
            return Err(LoadFailure::new(
                LoadStage::Sanitized,
                Error::CompilationError {
                    message: "source does not parse".to_string(),
                    line: None,
                },
            ));
        };

        let namespace = self.permissions.namespace();
        tracing::debug!(class = class_name, stage = %LoadStage::NamespaceBuilt, "namespace bound");

        let compiled = codegen::compile(&module, class_name, &namespace, &self.contract)
            .map_err(|err| LoadFailure::new(LoadStage::NamespaceBuilt, err))?;
        tracing::debug!(
            class = class_name,
            stage = %LoadStage::Compiled,
            wasm_bytes = compiled.wasm.len(),
            "strategy compiled to wasm"
        );

        let strategy = WasmStrategy::new(Arc::clone(&self.sandbox), namespace, compiled, source)
            .map_err(|err| LoadFailure::new(LoadStage::Compiled, err))?;
        tracing::info!(
            class = class_name,
            stage = %LoadStage::ClassValidated,
            wasm_hash = %strategy.wasm_hash(),
            "strategy class validated"
        );

        Ok(CachedClass {
            class: Arc::new(strategy),
            risk_level: report.risk_level(),
            warnings: report.warnings(),
        })
    }
}

/// Sanitizes, compiles and validates `ai` and `custom` records.
///
/// # Examples
///
/// ```no_run
/// use stratguard_audit::AuditLogger;
/// use stratguard_core::{GuardConfig, SourceType, StrategyId, StrategySourceRecord};
/// use stratguard_loader::{DynamicCodeLoader, StrategyCache};
/// use std::time::Duration;
///
/// # async fn demo() -> stratguard_core::Result<()> {
/// let config = GuardConfig::default();
/// let loader = DynamicCodeLoader::new(
///     &config,
///     AuditLogger::in_memory(1024),
///     StrategyCache::new(64, Duration::from_secs(300), 8),
/// )?;
/// let record = StrategySourceRecord::new(
///     StrategyId::new("flat"),
///     "class Flat:\n    def generate_signals(self, data):\n        return {}\n",
///     "Flat",
///     SourceType::Custom,
/// );
/// let instance = loader.load(&record, true).await?;
/// assert!(instance.metadata().warnings.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DynamicCodeLoader {
    pipeline: Pipeline,
    audit: AuditLogger,
    cache: StrategyCache,
    limits: ExecutionLimits,
}

impl DynamicCodeLoader {
    /// Creates a loader with its own sandbox engine, configured from
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeError`] if the sandbox engine cannot start.
    pub fn new(config: &GuardConfig, audit: AuditLogger, cache: StrategyCache) -> Result<Self> {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::from_guard(config))?);
        Ok(Self::with_sandbox(config, sandbox, audit, cache))
    }

    /// Creates a loader on an existing sandbox engine.
    #[must_use]
    pub fn with_sandbox(
        config: &GuardConfig,
        sandbox: Arc<Sandbox>,
        audit: AuditLogger,
        cache: StrategyCache,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                sanitizer: Arc::new(CodeSanitizer::with_allowed_modules(
                    config.policy.modules.iter().cloned(),
                )),
                permissions: PermissionChecker::new(PermissionPolicy::from_config(&config.policy)),
                contract: Arc::new(StrategyContract::standard()),
                sandbox,
            },
            audit,
            cache,
            limits: config.limits(),
        }
    }

    /// Sandbox engine compiled classes run in.
    #[must_use]
    pub const fn sandbox(&self) -> &Arc<Sandbox> {
        &self.pipeline.sandbox
    }

    /// Permission checker the namespace is resolved from.
    #[must_use]
    pub const fn permissions(&self) -> &PermissionChecker {
        &self.pipeline.permissions
    }

    /// Loads one record under `strict_mode`.
    ///
    /// Concurrent loads of the same source, class and mode share one
    /// compilation. Dropping the returned future abandons only this
    /// caller's wait.
    ///
    /// # Errors
    ///
    /// - [`Error::SecurityViolation`] if the sanitizer rejects the code or
    ///   the permission policy denies a symbol it uses
    /// - [`Error::CompilationError`] if the code is outside the compiled
    ///   subset or the class is missing or does not meet the contract
    pub async fn load(
        &self,
        record: &StrategySourceRecord,
        strict_mode: bool,
    ) -> Result<LoadedStrategyInstance> {
        let trail = LoadTrail::begin(
            &self.audit,
            record,
            record.content_hash(),
            LoaderKind::Dynamic,
            strict_mode,
        );
        let key = CacheKey::new(
            trail.hash().clone(),
            record.declared_class_name(),
            strict_mode,
            LoaderKind::Dynamic,
        );

        let pipeline = self.pipeline.clone();
        let source: Arc<str> = Arc::from(record.source_text());
        let class_name = record.declared_class_name().to_string();
        let result = self
            .cache
            .get_or_load(key, move || async move {
                let task = tokio::task::spawn_blocking(move || {
                    pipeline.run(source, &class_name, strict_mode)
                });
                match task.await {
                    Ok(result) => result,
                    Err(err) => Err(LoadFailure::new(
                        LoadStage::Received,
                        Error::RuntimeError {
                            message: format!("compilation task failed: {err}"),
                        },
                    )),
                }
            })
            .await;
        trail.finish(result, self.limits)
    }
}
