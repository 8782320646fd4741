//! Registry of trusted native strategy classes.
//!
//! Built-in records name a registered class and carry its parameters as
//! JSON. Native classes run on a blocking worker without the sandbox; they
//! still honour the budget and cancellation, and retain the parameter text
//! so integrity can be re-checked before each execution.

use crate::params::{ParamSpec, ParamValue, Params, validate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratguard_core::traits::StrategyClass;
use stratguard_core::{
    ContentHash, Error, Field, Invocation, LimitKind, MarketData, ResourceBudget, ResourceUsage,
    Result, Signals, StrategyOp,
};
use stratguard_runtime::limiter::run_bounded;
use tokio_util::sync::CancellationToken;

/// Builds a class from validated parameters and the retained source text.
pub type ClassBuilder = fn(&Params, Arc<str>) -> Result<Arc<dyn StrategyClass>>;

/// One registered class.
#[derive(Debug, Clone)]
pub struct RegisteredClass {
    name: String,
    description: String,
    specs: Vec<ParamSpec>,
    build: ClassBuilder,
}

impl RegisteredClass {
    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One-line description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared parameters.
    #[must_use]
    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Validates `source_text` against the declared parameters and builds
    /// the class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] on invalid parameters.
    pub fn instantiate(&self, source_text: &str) -> Result<Arc<dyn StrategyClass>> {
        let params = validate(&self.specs, source_text)?;
        (self.build)(&params, Arc::from(source_text))
    }
}

/// Name-indexed set of trusted classes.
///
/// # Examples
///
/// ```
/// use stratguard_loader::StrategyRegistry;
///
/// let registry = StrategyRegistry::with_builtins();
/// let class = registry
///     .get("MovingAverageCross")
///     .unwrap()
///     .instantiate(r#"{"fast": 5, "slow": 20}"#)
///     .unwrap();
/// assert_eq!(class.class_name(), "MovingAverageCross");
/// assert!(registry.get("Martingale").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    classes: BTreeMap<String, RegisteredClass>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `MovingAverageCross` and `Momentum`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(
            MovingAverageCross::NAME,
            "Long when the fast simple moving average is above the slow one",
            vec![
                ParamSpec::int("fast")
                    .with_range(1.0, 1_000.0)
                    .with_default(ParamValue::Int(10)),
                ParamSpec::int("slow")
                    .with_range(2.0, 5_000.0)
                    .with_default(ParamValue::Int(30)),
            ],
            MovingAverageCross::build,
        );
        registry.insert(
            Momentum::NAME,
            "Signals when the lookback return leaves the threshold band",
            vec![
                ParamSpec::int("lookback").with_range(1.0, 5_000.0),
                ParamSpec::float("threshold")
                    .with_range(0.0, 10.0)
                    .with_default(ParamValue::Float(0.0)),
            ],
            Momentum::build,
        );
        registry
    }

    fn insert(&mut self, name: &str, description: &str, specs: Vec<ParamSpec>, build: ClassBuilder) {
        self.classes.insert(
            name.to_string(),
            RegisteredClass {
                name: name.to_string(),
                description: description.to_string(),
                specs,
                build,
            },
        );
    }

    /// Registers a class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is taken.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        specs: Vec<ParamSpec>,
        build: ClassBuilder,
    ) -> Result<()> {
        if self.classes.contains_key(name) {
            return Err(Error::InvalidArgument(format!(
                "strategy class '{name}' is already registered"
            )));
        }
        self.insert(name, description, specs, build);
        Ok(())
    }

    /// Looks up a class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<&RegisteredClass> {
        self.classes.get(name).ok_or_else(|| Error::NotFound {
            resource: format!("strategy class '{name}'"),
        })
    }

    /// Registered class names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

fn window(params: &Params, name: &str) -> Result<usize> {
    usize::try_from(params.get_int(name)?).map_err(|_| Error::ValidationError {
        field: name.to_string(),
        reason: "must be positive".to_string(),
    })
}

fn verify_source(source: &str, expected: &ContentHash) -> Result<()> {
    let actual = ContentHash::of(source);
    if actual.verify(expected) {
        Ok(())
    } else {
        Err(Error::IntegrityError {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

const LIMIT_CHECK_INTERVAL: usize = 4096;

/// Native runs are single-threaded, so time on the worker stands in for CPU
/// time.
#[derive(Debug, Clone, Copy)]
struct NativeLimits {
    cpu: Duration,
    wall_clock: Duration,
    memory_bytes: u64,
}

impl NativeLimits {
    fn of(budget: &ResourceBudget) -> Self {
        Self {
            cpu: Duration::from_secs_f64(budget.cpu_seconds()),
            wall_clock: budget.wall_clock(),
            memory_bytes: budget.memory_bytes(),
        }
    }

    fn check(&self, started: Instant) -> Result<()> {
        let elapsed = started.elapsed();
        if elapsed > self.wall_clock {
            return Err(Error::ResourceLimitExceeded {
                limit: LimitKind::WallClock,
                message: format!(
                    "exceeded wall-clock budget of {:.3}s",
                    self.wall_clock.as_secs_f64()
                ),
            });
        }
        if elapsed > self.cpu {
            return Err(Error::ResourceLimitExceeded {
                limit: LimitKind::Cpu,
                message: format!("exceeded CPU budget of {:.3}s", self.cpu.as_secs_f64()),
            });
        }
        Ok(())
    }
}

/// Runs `compute` for one bar at a time on a blocking worker, bounded by the
/// budget and `cancel`.
///
/// The worker checks the token and the budget every
/// [`LIMIT_CHECK_INTERVAL`] bars and stops once the caller has given up.
async fn run_native<F>(
    op: StrategyOp,
    data: Arc<MarketData>,
    budget: &ResourceBudget,
    cancel: &CancellationToken,
    start: usize,
    compute: F,
) -> Result<Invocation>
where
    F: FnMut(&MarketData, usize) -> Option<f64> + Send + 'static,
{
    let limits = NativeLimits::of(budget);
    let worker_cancel = cancel.child_token();
    let _stop_worker = worker_cancel.clone().drop_guard();
    let task = tokio::task::spawn_blocking(move || {
        native_loop(op, &data, limits, &worker_cancel, start, compute)
    });
    let joined = async move {
        task.await.map_err(|err| Error::RuntimeError {
            message: format!("native strategy task failed: {err}"),
        })?
    };
    run_bounded(joined, limits.wall_clock, cancel).await
}

fn native_loop<F>(
    op: StrategyOp,
    data: &MarketData,
    limits: NativeLimits,
    cancel: &CancellationToken,
    start: usize,
    mut compute: F,
) -> Result<Invocation>
where
    F: FnMut(&MarketData, usize) -> Option<f64>,
{
    let started = Instant::now();
    let mut output = Signals::new();
    for i in start..data.len() {
        if i % LIMIT_CHECK_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: op.method_name().to_string(),
                });
            }
            limits.check(started)?;
        }
        if let Some(value) = compute(data, i) {
            output.insert(i as i64, value);
        }
    }
    limits.check(started)?;
    let peak_memory_bytes = (output.len() * 2 * std::mem::size_of::<f64>()) as u64;
    if peak_memory_bytes > limits.memory_bytes {
        return Err(Error::ResourceLimitExceeded {
            limit: LimitKind::Memory,
            message: format!("{peak_memory_bytes} bytes of output exceed the memory budget"),
        });
    }
    Ok(Invocation {
        output,
        usage: ResourceUsage {
            fuel_consumed: 0,
            elapsed_us: started.elapsed().as_micros() as u64,
            peak_memory_bytes,
        },
    })
}

fn sign(value: f64, band: f64) -> f64 {
    if value > band {
        1.0
    } else if value < -band {
        -1.0
    } else {
        0.0
    }
}

/// Simple moving average crossover.
#[derive(Debug)]
pub struct MovingAverageCross {
    fast: usize,
    slow: usize,
    source: Arc<str>,
}

impl MovingAverageCross {
    /// Registered name.
    pub const NAME: &'static str = "MovingAverageCross";

    fn build(params: &Params, source: Arc<str>) -> Result<Arc<dyn StrategyClass>> {
        let fast = window(params, "fast")?;
        let slow = window(params, "slow")?;
        if fast >= slow {
            return Err(Error::ValidationError {
                field: "fast".to_string(),
                reason: format!("must be less than slow ({fast} >= {slow})"),
            });
        }
        Ok(Arc::new(Self { fast, slow, source }))
    }

    /// Mean of `close[i + 1 - n ..= i]` from prefix sums.
    fn mean(prefix: &[f64], i: usize, n: usize) -> f64 {
        (prefix[i + 1] - prefix[i + 1 - n]) / n as f64
    }
}

#[async_trait]
impl StrategyClass for MovingAverageCross {
    fn class_name(&self) -> &str {
        Self::NAME
    }

    fn operations(&self) -> &[StrategyOp] {
        &StrategyOp::ALL
    }

    fn verify_integrity(&self, expected: &ContentHash) -> Result<()> {
        verify_source(&self.source, expected)
    }

    async fn invoke(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: CancellationToken,
    ) -> Result<Invocation> {
        let (fast, slow) = (self.fast, self.slow);
        let mut prefix: Option<Vec<f64>> = None;
        run_native(op, data, &budget, &cancel, slow - 1, move |data, i| {
            let prefix = prefix.get_or_insert_with(|| prefix_sums(data.series(Field::Close)));
            let fast_ma = Self::mean(prefix, i, fast);
            let slow_ma = Self::mean(prefix, i, slow);
            match op {
                StrategyOp::GenerateSignals => Some(sign(fast_ma - slow_ma, 0.0)),
                StrategyOp::CalculateScores => {
                    (slow_ma != 0.0).then(|| (fast_ma - slow_ma) / slow_ma)
                }
            }
        })
        .await
    }
}

fn prefix_sums(close: &[f64]) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(close.len() + 1);
    let mut sum = 0.0;
    prefix.push(sum);
    for value in close {
        sum += value;
        prefix.push(sum);
    }
    prefix
}

/// Lookback return against a symmetric threshold band.
#[derive(Debug)]
pub struct Momentum {
    lookback: usize,
    threshold: f64,
    source: Arc<str>,
}

impl Momentum {
    /// Registered name.
    pub const NAME: &'static str = "Momentum";

    fn build(params: &Params, source: Arc<str>) -> Result<Arc<dyn StrategyClass>> {
        Ok(Arc::new(Self {
            lookback: window(params, "lookback")?,
            threshold: params.get_float("threshold")?,
            source,
        }))
    }
}

#[async_trait]
impl StrategyClass for Momentum {
    fn class_name(&self) -> &str {
        Self::NAME
    }

    fn operations(&self) -> &[StrategyOp] {
        &StrategyOp::ALL
    }

    fn verify_integrity(&self, expected: &ContentHash) -> Result<()> {
        verify_source(&self.source, expected)
    }

    async fn invoke(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: CancellationToken,
    ) -> Result<Invocation> {
        let (lookback, threshold) = (self.lookback, self.threshold);
        run_native(op, data, &budget, &cancel, lookback, move |data, i| {
            let close = data.series(Field::Close);
            let base = close[i - lookback];
            if base == 0.0 {
                return None;
            }
            let ret = close[i] / base - 1.0;
            match op {
                StrategyOp::GenerateSignals => Some(sign(ret, threshold)),
                StrategyOp::CalculateScores => Some(ret),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> ResourceBudget {
        ResourceBudget::new(1.0, 1024 * 1024, 1.0).unwrap()
    }

    fn data() -> Arc<MarketData> {
        Arc::new(MarketData::from_closes(vec![
            1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0,
        ]))
    }

    #[tokio::test]
    async fn test_moving_average_cross_signals() {
        let class = StrategyRegistry::with_builtins()
            .get("MovingAverageCross")
            .unwrap()
            .instantiate(r#"{"fast": 1, "slow": 3}"#)
            .unwrap();
        let result = class
            .invoke(StrategyOp::GenerateSignals, data(), budget(), CancellationToken::new())
            .await
            .unwrap();
        let signals: Vec<f64> = result.output.values().copied().collect();
        assert_eq!(result.output.keys().next(), Some(&2));
        assert_eq!(signals, vec![1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0]);
    }

    #[tokio::test]
    async fn test_momentum_scores_and_band() {
        let class = StrategyRegistry::with_builtins()
            .get("Momentum")
            .unwrap()
            .instantiate(r#"{"lookback": 2, "threshold": 0.5}"#)
            .unwrap();
        let scores = class
            .invoke(StrategyOp::CalculateScores, data(), budget(), CancellationToken::new())
            .await
            .unwrap()
            .output;
        assert!((scores[&2] - 2.0).abs() < 1e-12);
        assert!((scores[&6] - (3.0 / 5.0 - 1.0)).abs() < 1e-12);

        let signals = class
            .invoke(StrategyOp::GenerateSignals, data(), budget(), CancellationToken::new())
            .await
            .unwrap()
            .output;
        assert_eq!(signals[&2], 1.0);
        assert_eq!(signals[&5], 0.0);
        assert_eq!(signals[&8], -1.0);
    }

    #[test]
    fn test_cross_requires_fast_below_slow() {
        let registry = StrategyRegistry::with_builtins();
        let cross = registry.get("MovingAverageCross").unwrap();
        let err = cross.instantiate(r#"{"fast": 30, "slow": 10}"#).unwrap_err();
        assert!(err.is_validation_error());
        assert!(cross.instantiate("{}").is_ok());
    }

    #[test]
    fn test_native_integrity_tracks_parameter_text() {
        let text = r#"{"lookback": 3}"#;
        let class = StrategyRegistry::with_builtins()
            .get("Momentum")
            .unwrap()
            .instantiate(text)
            .unwrap();
        assert!(class.verify_integrity(&ContentHash::of(text)).is_ok());
        assert!(
            class
                .verify_integrity(&ContentHash::of(r#"{"lookback": 4}"#))
                .unwrap_err()
                .is_integrity_error()
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_native_run() {
        let class = StrategyRegistry::with_builtins()
            .get("Momentum")
            .unwrap()
            .instantiate(r#"{"lookback": 1}"#)
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let data = Arc::new(MarketData::from_closes(vec![1.0; 10_000]));
        let err = class
            .invoke(StrategyOp::GenerateSignals, data, budget(), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_native_run_stops_at_wall_clock_budget() {
        let class = StrategyRegistry::with_builtins()
            .get("Momentum")
            .unwrap()
            .instantiate(r#"{"lookback": 1}"#)
            .unwrap();
        let data = Arc::new(MarketData::from_closes(vec![1.0; 5_000_000]));
        let tight = ResourceBudget::new(10.0, u64::MAX, 0.001).unwrap();

        let started = Instant::now();
        let err = class
            .invoke(StrategyOp::GenerateSignals, data, tight, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_resource_limit(), "{err}");
        assert_eq!(err.limit_kind(), Some(LimitKind::WallClock));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_native_run_reports_cpu_budget() {
        let class = StrategyRegistry::with_builtins()
            .get("Momentum")
            .unwrap()
            .instantiate(r#"{"lookback": 1}"#)
            .unwrap();
        let data = Arc::new(MarketData::from_closes(vec![1.0; 5_000_000]));
        let tight = ResourceBudget::new(0.001, u64::MAX, 10.0).unwrap();

        let err = class
            .invoke(StrategyOp::CalculateScores, data, tight, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.limit_kind(), Some(LimitKind::Cpu));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StrategyRegistry::with_builtins();
        let err = registry
            .register("Momentum", "again", Vec::new(), Momentum::build)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(registry.names().collect::<Vec<_>>(), ["Momentum", "MovingAverageCross"]);
    }
}
