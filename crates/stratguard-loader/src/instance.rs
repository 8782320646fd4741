//! Loaded strategy instances handed to the execution engine.

use serde::Serialize;
use std::sync::Arc;
use stratguard_audit::{AuditEvent, AuditEventType, AuditLogger};
use stratguard_core::traits::StrategyClass;
use stratguard_core::{
    ContentHash, Error, ExecutionLimits, Invocation, MarketData, Result, RiskLevel, Signals,
    SourceType, StrategyId, StrategyOp,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What was loaded and under which verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceMetadata {
    /// Record the instance was loaded from
    pub strategy_id: StrategyId,
    /// Validated class
    pub class_name: String,
    /// Provenance of the record
    pub source_type: SourceType,
    /// Sanitizer verdict; `safe` for built-in classes
    pub risk_level: RiskLevel,
    /// Digest of the source text at load time
    pub code_hash: ContentHash,
    /// Findings tolerated in lenient mode
    pub warnings: Vec<String>,
    /// Operations the class implements
    pub operations: Vec<StrategyOp>,
}

/// A validated strategy class bound to execution limits and the audit trail.
///
/// Cloning is cheap; clones share the class.
#[derive(Debug, Clone)]
pub struct LoadedStrategyInstance {
    class: Arc<dyn StrategyClass>,
    metadata: InstanceMetadata,
    limits: ExecutionLimits,
    audit: AuditLogger,
}

impl LoadedStrategyInstance {
    pub(crate) fn new(
        class: Arc<dyn StrategyClass>,
        metadata: InstanceMetadata,
        limits: ExecutionLimits,
        audit: AuditLogger,
    ) -> Self {
        Self {
            class,
            metadata,
            limits,
            audit,
        }
    }

    /// Load metadata.
    #[must_use]
    pub const fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }

    /// Limits each execution is minted a budget from.
    #[must_use]
    pub const fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Replaces the execution limits of this handle.
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The class shared with the cache.
    #[must_use]
    pub const fn class(&self) -> &Arc<dyn StrategyClass> {
        &self.class
    }

    /// Runs `generate_signals`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn generate_signals(
        &self,
        data: Arc<MarketData>,
        cancel: CancellationToken,
    ) -> Result<Signals> {
        self.execute(StrategyOp::GenerateSignals, data, cancel)
            .await
            .map(|invocation| invocation.output)
    }

    /// Runs `calculate_scores`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn calculate_scores(
        &self,
        data: Arc<MarketData>,
        cancel: CancellationToken,
    ) -> Result<Signals> {
        self.execute(StrategyOp::CalculateScores, data, cancel)
            .await
            .map(|invocation| invocation.output)
    }

    /// Verifies integrity, then runs `op` under a fresh budget.
    ///
    /// Records `execution_start` and exactly one `execution_end`, whose
    /// outcome is `ok`, `timeout`, `cpu_limit`, `memory_limit`, `cancelled`,
    /// `integrity_failure` or `failed`.
    ///
    /// # Errors
    ///
    /// - [`Error::IntegrityError`] if the retained source no longer matches
    /// - [`Error::ResourceLimitExceeded`] if a budget is breached
    /// - [`Error::Cancelled`] if `cancel` fires first
    /// - [`Error::ExecutionFailed`] if the strategy code fails
    pub async fn execute(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        cancel: CancellationToken,
    ) -> Result<Invocation> {
        let execution_id = Uuid::new_v4().to_string();
        let subject = self.metadata.strategy_id.as_str();
        self.audit.record(
            AuditEvent::new(AuditEventType::ExecutionStart, subject, "started")
                .with_detail("execution_id", execution_id.as_str())
                .with_detail("operation", op.method_name())
                .with_detail("class_name", self.metadata.class_name.as_str())
                .with_detail("bars", data.len()),
        );

        let result = self.run(op, data, cancel).await;

        let mut end = AuditEvent::new(AuditEventType::ExecutionEnd, subject, outcome(&result))
            .with_detail("execution_id", execution_id.as_str())
            .with_detail("operation", op.method_name());
        match &result {
            Ok(invocation) => {
                tracing::info!(
                    strategy = %self.metadata.strategy_id,
                    op = %op,
                    outputs = invocation.output.len(),
                    elapsed_us = invocation.usage.elapsed_us,
                    fuel = invocation.usage.fuel_consumed,
                    "strategy executed"
                );
                end = end
                    .with_detail("outputs", invocation.output.len())
                    .with_detail("elapsed_us", invocation.usage.elapsed_us)
                    .with_detail("fuel_consumed", invocation.usage.fuel_consumed)
                    .with_detail("peak_memory_bytes", invocation.usage.peak_memory_bytes);
            }
            Err(err) => {
                if err.is_integrity_error() {
                    tracing::error!(
                        strategy = %self.metadata.strategy_id,
                        error = %err,
                        "strategy integrity check failed"
                    );
                } else {
                    tracing::warn!(
                        strategy = %self.metadata.strategy_id,
                        op = %op,
                        error = %err,
                        "strategy execution aborted"
                    );
                }
                end = end.with_detail("error", err.to_string());
            }
        }
        self.audit.record(end);
        result
    }

    async fn run(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        cancel: CancellationToken,
    ) -> Result<Invocation> {
        self.class.verify_integrity(&self.metadata.code_hash)?;
        let budget = self.limits.budget()?;
        self.class.invoke(op, data, budget, cancel).await
    }
}

fn outcome(result: &Result<Invocation>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(Error::ResourceLimitExceeded { limit, .. }) => limit.outcome(),
        Err(Error::Cancelled { .. }) => "cancelled",
        Err(Error::IntegrityError { .. }) => "integrity_failure",
        Err(_) => "failed",
    }
}
