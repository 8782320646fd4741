//! Compile-time checks that shared types can cross task boundaries.

use std::sync::Arc;
use stratguard_core::traits::{SourceStore, StrategyClass};
use stratguard_core::{
    ContentHash, Error, GuardConfig, MarketData, ResourceBudget, SanitizationReport,
    StrategySourceRecord,
};

const fn assert_send<T: Send>() {}
const fn assert_sync<T: Sync>() {}

#[test]
fn test_domain_types_are_send_sync() {
    assert_send::<Error>();
    assert_sync::<Error>();
    assert_send::<ContentHash>();
    assert_sync::<ContentHash>();
    assert_send::<StrategySourceRecord>();
    assert_sync::<StrategySourceRecord>();
    assert_send::<SanitizationReport>();
    assert_sync::<SanitizationReport>();
    assert_send::<GuardConfig>();
    assert_sync::<GuardConfig>();
    assert_send::<Arc<MarketData>>();
    assert_send::<ResourceBudget>();
}

#[test]
fn test_trait_objects_are_send_sync() {
    assert_send::<Arc<dyn SourceStore>>();
    assert_sync::<Arc<dyn SourceStore>>();
    assert_send::<Arc<dyn StrategyClass>>();
    assert_sync::<Arc<dyn StrategyClass>>();
}

#[tokio::test]
async fn test_error_crosses_task_boundary() {
    let handle = tokio::spawn(async {
        Error::Cancelled {
            operation: "load".to_string(),
        }
    });
    let err = handle.await.unwrap();
    assert!(err.is_cancelled());
}
