//! Source record lookup.

use crate::{Result, StrategyId, StrategySourceRecord};
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-only access to persisted strategy source records.
///
/// # Examples
///
/// ```
/// use stratguard_core::traits::SourceStore;
/// use stratguard_core::{Error, Result, SourceType, StrategyId, StrategySourceRecord};
/// use async_trait::async_trait;
/// use std::collections::HashMap;
///
/// struct Fixed(StrategySourceRecord);
///
/// #[async_trait]
/// impl SourceStore for Fixed {
///     async fn fetch(&self, id: &StrategyId) -> Result<StrategySourceRecord> {
///         if self.0.id() == id {
///             Ok(self.0.clone())
///         } else {
///             Err(Error::NotFound { resource: id.to_string() })
///         }
///     }
///
///     async fn fetch_many(
///         &self,
///         ids: &[StrategyId],
///     ) -> Result<HashMap<StrategyId, StrategySourceRecord>> {
///         Ok(ids
///             .iter()
///             .filter(|id| *id == self.0.id())
///             .map(|id| (id.clone(), self.0.clone()))
///             .collect())
///     }
/// }
/// ```
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no record has this id.
    async fn fetch(&self, id: &StrategyId) -> Result<StrategySourceRecord>;

    /// Fetches many records in one round trip. Ids without a record are
    /// absent from the returned map.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup as a whole failed.
    async fn fetch_many(
        &self,
        ids: &[StrategyId],
    ) -> Result<HashMap<StrategyId, StrategySourceRecord>>;
}
