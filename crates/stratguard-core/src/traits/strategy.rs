//! Executable strategy classes.

use crate::{ContentHash, Invocation, MarketData, ResourceBudget, Result, StrategyOp};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A validated strategy class, ready to be invoked.
///
/// One class value may back many loaded instances (cache hits share it).
/// Implementations keep no per-invocation state: every [`invoke`] starts from
/// fresh class attributes.
///
/// [`invoke`]: StrategyClass::invoke
#[async_trait]
pub trait StrategyClass: Send + Sync + fmt::Debug {
    /// Name of the class.
    fn class_name(&self) -> &str;

    /// Operations the class implements.
    fn operations(&self) -> &[StrategyOp];

    /// Recomputes the digests of the retained source (and compiled module)
    /// and compares them with the ones recorded at load time.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::IntegrityError`] on mismatch.
    fn verify_integrity(&self, expected: &ContentHash) -> Result<()>;

    /// Runs one operation under `budget`.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::InvalidArgument`] if the class lacks `op`
    /// - [`crate::Error::ResourceLimitExceeded`] if a budget is breached
    /// - [`crate::Error::Cancelled`] if `cancel` fires first
    /// - [`crate::Error::ExecutionFailed`] if the strategy code fails
    async fn invoke(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: CancellationToken,
    ) -> Result<Invocation>;
}
