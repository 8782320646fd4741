//! Audit records for one load: `load_attempt`, then one terminal event.

use crate::cache::{CacheOutcome, CachedClass, LoaderKind};
use crate::instance::{InstanceMetadata, LoadedStrategyInstance};
use crate::stage::{LoadFailure, LoadStage};
use stratguard_audit::{AuditEvent, AuditEventType, AuditLogger};
use stratguard_core::{ContentHash, Error, ExecutionLimits, Result, StrategySourceRecord};

pub(crate) struct LoadTrail<'a> {
    audit: &'a AuditLogger,
    record: &'a StrategySourceRecord,
    hash: ContentHash,
    kind: LoaderKind,
}

impl<'a> LoadTrail<'a> {
    /// Records `load_attempt`.
    pub(crate) fn begin(
        audit: &'a AuditLogger,
        record: &'a StrategySourceRecord,
        hash: ContentHash,
        kind: LoaderKind,
        strict_mode: bool,
    ) -> Self {
        audit.record(
            AuditEvent::new(AuditEventType::LoadAttempt, record.id().as_str(), "received")
                .with_detail("loader", kind.as_str())
                .with_detail("source_type", record.source_type().as_str())
                .with_detail("class_name", record.declared_class_name())
                .with_detail("code_hash", hash.as_str())
                .with_detail("strict_mode", strict_mode),
        );
        tracing::debug!(
            strategy = %record.id(),
            stage = %LoadStage::Hashed,
            hash = %hash,
            "load started"
        );
        Self {
            audit,
            record,
            hash,
            kind,
        }
    }

    pub(crate) const fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Records the terminal event and builds the instance on success.
    pub(crate) fn finish(
        self,
        result: std::result::Result<(CachedClass, CacheOutcome), LoadFailure>,
        limits: ExecutionLimits,
    ) -> Result<LoadedStrategyInstance> {
        let subject = self.record.id().as_str();
        match result {
            Ok((cached, outcome)) => {
                self.audit.record(
                    AuditEvent::new(AuditEventType::LoadSuccess, subject, outcome.as_str())
                        .with_detail("loader", self.kind.as_str())
                        .with_detail("stage", LoadStage::Ready.as_str())
                        .with_detail("class_name", cached.class.class_name())
                        .with_detail("risk_level", cached.risk_level.as_str())
                        .with_detail("warnings", cached.warnings.len()),
                );
                tracing::debug!(
                    strategy = %self.record.id(),
                    stage = %LoadStage::Ready,
                    outcome = outcome.as_str(),
                    "load finished"
                );
                let metadata = InstanceMetadata {
                    strategy_id: self.record.id().clone(),
                    class_name: cached.class.class_name().to_string(),
                    source_type: self.record.source_type(),
                    risk_level: cached.risk_level,
                    code_hash: self.hash,
                    warnings: cached.warnings,
                    operations: cached.class.operations().to_vec(),
                };
                Ok(LoadedStrategyInstance::new(
                    cached.class,
                    metadata,
                    limits,
                    self.audit.clone(),
                ))
            }
            Err(failure) => {
                let mut event = AuditEvent::new(failure.event_type(), subject, failure.outcome())
                    .with_detail("loader", self.kind.as_str())
                    .with_detail("stage", failure.stage.as_str())
                    .with_detail("error", failure.error.to_string());
                if let Some(report) = failure.error.report() {
                    event = event
                        .with_detail("risk_level", report.risk_level().as_str())
                        .with_detail("violations", report.warnings());
                }
                self.audit.record(event);
                tracing::info!(
                    strategy = %self.record.id(),
                    stage = %failure.stage,
                    error = %failure.error,
                    "load refused"
                );
                Err(Error::from(failure))
            }
        }
    }
}
