//! Load pipeline tests through the factory, with a mocked source store.

use async_trait::async_trait;
use mockall::mock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratguard_audit::{AuditEventType, AuditFilter, AuditLogger, read_log, verify_chain};
use stratguard_core::traits::SourceStore;
use stratguard_core::{
    Error, GuardConfig, LimitKind, MarketData, Result, RiskLevel, SourceType, StrategyId,
    StrategySourceRecord,
};
use stratguard_loader::{LoaderFactory, StrategyRegistry};
use tokio_util::sync::CancellationToken;

mock! {
    pub Store {}

    #[async_trait]
    impl SourceStore for Store {
        async fn fetch(&self, id: &StrategyId) -> Result<StrategySourceRecord>;
        async fn fetch_many(
            &self,
            ids: &[StrategyId],
        ) -> Result<HashMap<StrategyId, StrategySourceRecord>>;
    }
}

/// In-memory store whose records can be replaced between calls.
#[derive(Default)]
struct MemoryStore {
    records: std::sync::Mutex<HashMap<StrategyId, StrategySourceRecord>>,
}

impl MemoryStore {
    fn with(records: impl IntoIterator<Item = StrategySourceRecord>) -> Arc<Self> {
        let store = Self::default();
        for record in records {
            store.put(record);
        }
        Arc::new(store)
    }

    fn put(&self, record: StrategySourceRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id().clone(), record);
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn fetch(&self, id: &StrategyId) -> Result<StrategySourceRecord> {
        self.records
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                resource: id.to_string(),
            })
    }

    async fn fetch_many(
        &self,
        ids: &[StrategyId],
    ) -> Result<HashMap<StrategyId, StrategySourceRecord>> {
        let records = self.records.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stratguard_loader=debug")
        .with_test_writer()
        .try_init();
}

fn ai(id: &str, source: &str, class: &str) -> StrategySourceRecord {
    StrategySourceRecord::new(StrategyId::new(id), source, class, SourceType::Ai)
}

fn factory(strict: bool, store: Arc<dyn SourceStore>) -> LoaderFactory {
    let config = GuardConfig::builder()
        .strict_mode(strict)
        .max_cache_size(32)
        .cache_shards(4)
        .build();
    LoaderFactory::new(&config, store).expect("factory")
}

fn count(factory: &LoaderFactory, event_type: AuditEventType) -> usize {
    factory
        .audit()
        .query(&AuditFilter::new().event_type(event_type))
        .count()
}

const SCENARIO_A: &str = "class S(BaseStrategy):\n def generate_signals(self, *a): return {}";

const TREND: &str = "
class Trend:
    def generate_signals(self, data):
        out = {}
        for i in range(1, len(data)):
            if data[i] > data[i - 1]:
                out[i] = 1.0
            else:
                out[i] = -1.0
        return out
";

#[tokio::test]
async fn test_variadic_entry_loads_safe_in_strict_mode() {
    init_tracing();
    let store = MemoryStore::with([ai("a", SCENARIO_A, "S")]);
    let factory = factory(true, store);

    let instance = factory
        .load(SourceType::Ai, &StrategyId::new("a"))
        .await
        .unwrap();
    assert_eq!(instance.metadata().risk_level, RiskLevel::Safe);
    assert!(instance.metadata().warnings.is_empty());

    let signals = instance
        .generate_signals(
            Arc::new(MarketData::from_closes(vec![1.0, 2.0])),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(signals.is_empty());
}

#[tokio::test]
async fn test_os_system_call_is_critical_violation() {
    let source = "
import os

class Wipe:
    def generate_signals(self, data):
        os.system(\"rm -rf /\")
        return {}
";
    let store = MemoryStore::with([ai("b", source, "Wipe")]);
    let factory = factory(false, store);

    let err = factory
        .load(SourceType::Ai, &StrategyId::new("b"))
        .await
        .unwrap_err();
    assert!(err.is_security_violation());
    assert_eq!(err.report().map(|r| r.risk_level()), Some(RiskLevel::Critical));
    assert_eq!(count(&factory, AuditEventType::SecurityViolation), 1);
    assert_eq!(count(&factory, AuditEventType::LoadSuccess), 0);
}

#[tokio::test]
async fn test_lenient_reflection_import_loads_with_warnings() {
    let source = "
import inspect

class Peek:
    def generate_signals(self, data):
        return {0: data[0]}
";
    let store = MemoryStore::with([ai("c", source, "Peek")]);
    let factory = factory(false, store);

    let instance = factory
        .load(SourceType::Ai, &StrategyId::new("c"))
        .await
        .unwrap();
    assert_eq!(instance.metadata().risk_level, RiskLevel::Medium);
    assert!(!instance.metadata().warnings.is_empty());
}

#[tokio::test]
async fn test_non_whitelisted_import_fails_strict_load() {
    let source = format!("import statistics\n{TREND}");
    let store = MemoryStore::with([ai("imp", &source, "Trend")]);
    let factory = factory(true, store);

    let err = factory
        .load(SourceType::Ai, &StrategyId::new("imp"))
        .await
        .unwrap_err();
    let report = err.report().expect("sanitizer report");
    assert!(report.risk_level() >= RiskLevel::Low);
    assert!(!report.passed());
}

#[tokio::test]
async fn test_missing_class_is_compilation_error() {
    let store = MemoryStore::with([ai("m", TREND, "Breakout")]);
    let factory = factory(true, store);

    let err = factory
        .load(SourceType::Ai, &StrategyId::new("m"))
        .await
        .unwrap_err();
    assert!(err.is_compilation_error());
    assert_eq!(count(&factory, AuditEventType::LoadDenied), 1);
}

#[tokio::test]
async fn test_two_loads_compile_once_and_audit_twice() {
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let factory = factory(true, store);
    let id = StrategyId::new("t");

    let first = factory.load(SourceType::Ai, &id).await.unwrap();
    let second = factory.load(SourceType::Ai, &id).await.unwrap();

    assert!(Arc::ptr_eq(first.class(), second.class()));
    assert_eq!(factory.cache_stats().compilations, 1);
    assert_eq!(factory.cache_stats().hits, 1);
    assert_eq!(count(&factory, AuditEventType::LoadAttempt), 2);
    assert_eq!(count(&factory, AuditEventType::LoadSuccess), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_compilation() {
    init_tracing();
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let factory = Arc::new(factory(true, store));

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.load(SourceType::Ai, &StrategyId::new("t")).await })
        })
        .collect();
    let mut instances = Vec::new();
    for task in tasks {
        instances.push(task.await.unwrap().unwrap());
    }

    assert_eq!(factory.cache_stats().compilations, 1);
    assert!(
        instances
            .windows(2)
            .all(|pair| Arc::ptr_eq(pair[0].class(), pair[1].class()))
    );
    assert_eq!(count(&factory, AuditEventType::LoadAttempt), 12);
    assert_eq!(count(&factory, AuditEventType::LoadSuccess), 12);
}

#[tokio::test]
async fn test_infinite_loop_times_out_with_audit() {
    init_tracing();
    let source = "
class Spin:
    def generate_signals(self, data):
        while True:
            pass
        return {}
";
    let store = MemoryStore::with([ai("spin", source, "Spin")]);
    let config = GuardConfig::builder()
        .cpu_limit_seconds(1_000.0)
        .wall_clock_timeout_seconds(0.3)
        .build();
    let factory = LoaderFactory::new(&config, store).unwrap();
    let instance = factory
        .load(SourceType::Ai, &StrategyId::new("spin"))
        .await
        .unwrap();

    let started = Instant::now();
    let err = instance
        .generate_signals(
            Arc::new(MarketData::from_closes(vec![1.0])),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.limit_kind(), Some(LimitKind::WallClock));
    assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_secs(1));

    let end = factory
        .audit()
        .query(&AuditFilter::new().event_type(AuditEventType::ExecutionEnd))
        .last()
        .unwrap();
    assert_eq!(end.outcome, "timeout");

    // The strategy stays loaded after an aborted execution.
    let again = factory
        .load(SourceType::Ai, &StrategyId::new("spin"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(again.class(), instance.class()));
}

#[tokio::test]
async fn test_batch_load_fetches_once_and_collects_failures() {
    let trend = ai("t", TREND, "Trend");
    let bad = ai("bad", "import subprocess\nclass X: pass\n", "X");
    let mut store = MockStore::new();
    store.expect_fetch().never();
    store.expect_fetch_many().times(1).returning(move |ids| {
        Ok([trend.clone(), bad.clone()]
            .into_iter()
            .filter(|record| ids.contains(record.id()))
            .map(|record| (record.id().clone(), record))
            .collect())
    });
    let factory = factory(true, Arc::new(store));

    let ids = [
        StrategyId::new("t"),
        StrategyId::new("missing"),
        StrategyId::new("bad"),
    ];
    let batch = factory.batch_load(SourceType::Ai, &ids).await.unwrap();

    assert_eq!(batch.loaded.len(), 1);
    assert_eq!(batch.loaded[0].metadata().strategy_id, ids[0]);
    let failed: Vec<&str> = batch.failed.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(failed, ["missing", "bad"]);
    assert!(batch.failed[0].1.is_not_found());
    assert!(batch.failed[1].1.is_security_violation());
}

#[tokio::test]
async fn test_builtin_records_use_config_loader() {
    let record = StrategySourceRecord::new(
        StrategyId::new("mac"),
        r#"{"fast": 2, "slow": 4}"#,
        "MovingAverageCross",
        SourceType::Builtin,
    );
    let mut store = MockStore::new();
    store
        .expect_fetch()
        .times(1)
        .returning(move |_| Ok(record.clone()));
    let factory = factory(true, Arc::new(store));

    let instance = factory
        .load(SourceType::Builtin, &StrategyId::new("mac"))
        .await
        .unwrap();
    let scores = instance
        .calculate_scores(
            Arc::new(MarketData::from_closes(vec![1.0, 2.0, 3.0, 4.0, 5.0])),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(scores.len(), 2);
    assert!(scores.values().all(|score| *score > 0.0));
}

#[tokio::test]
async fn test_source_type_mismatch_is_rejected() {
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let factory = factory(true, store);
    let err = factory
        .load(SourceType::Builtin, &StrategyId::new("t"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(count(&factory, AuditEventType::LoadDenied), 1);
}

#[tokio::test]
async fn test_verify_detects_substituted_source() {
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let factory = factory(true, Arc::clone(&store) as Arc<dyn SourceStore>);
    let id = StrategyId::new("t");
    let instance = factory.load(SourceType::Ai, &id).await.unwrap();
    assert!(factory.verify(&instance).await.is_ok());

    let altered = TREND.replace("-1.0", "0.0");
    store.put(ai("t", &altered, "Trend"));
    assert!(factory.verify(&instance).await.unwrap_err().is_integrity_error());

    let reloaded = factory.reload(&id).await.unwrap();
    assert_ne!(reloaded.metadata().code_hash, instance.metadata().code_hash);
    assert!(factory.verify(&reloaded).await.is_ok());
}

#[tokio::test]
async fn test_reload_forces_recompilation() {
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let factory = factory(true, store);
    let id = StrategyId::new("t");

    factory.load(SourceType::Ai, &id).await.unwrap();
    factory.reload(&id).await.unwrap();
    assert_eq!(factory.cache_stats().compilations, 2);
}

#[tokio::test]
async fn test_audit_file_chain_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let store = MemoryStore::with([ai("t", TREND, "Trend")]);
    let config = GuardConfig::default();
    let audit = AuditLogger::with_file(&path, 256);
    let factory = LoaderFactory::with_parts(
        &config,
        store,
        StrategyRegistry::with_builtins(),
        audit.clone(),
    )
    .unwrap();

    let instance = factory
        .load(SourceType::Ai, &StrategyId::new("t"))
        .await
        .unwrap();
    instance
        .generate_signals(
            Arc::new(MarketData::from_closes(vec![1.0, 2.0, 1.5])),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(audit.flush());

    let events = read_log(&path).unwrap();
    let types: Vec<AuditEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        [
            AuditEventType::LoadAttempt,
            AuditEventType::LoadSuccess,
            AuditEventType::ExecutionStart,
            AuditEventType::ExecutionEnd,
        ]
    );
    assert!(verify_chain(&events).is_valid());
}
