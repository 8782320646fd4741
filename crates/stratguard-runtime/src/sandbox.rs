//! WASM sandbox using Wasmtime.
//!
//! One [`Sandbox`] owns the engine, the compiled module cache and the epoch
//! ticker. Every execution gets its own store, so executions share nothing
//! but immutable compiled code.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratguard_core::{MarketData, ResourceBudget};
//! use stratguard_runtime::config::SandboxConfig;
//! use stratguard_runtime::permissions::{PermissionPolicy, build_namespace};
//! use stratguard_runtime::Sandbox;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(wasm: &[u8]) -> stratguard_core::Result<()> {
//! let sandbox = Sandbox::new(SandboxConfig::default())?;
//! let module = sandbox.compile(wasm)?;
//! let namespace = build_namespace(&PermissionPolicy::default());
//!
//! let invocation = sandbox
//!     .execute(
//!         &module,
//!         &namespace,
//!         "generate_signals",
//!         Arc::new(MarketData::from_closes(vec![1.0, 2.0])),
//!         ResourceBudget::new(1.0, 16 * 1024 * 1024, 5.0)?,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{} signals", invocation.output.len());
//! # Ok(())
//! # }
//! ```

use crate::cache::ModuleCache;
use crate::config::SandboxConfig;
use crate::host::{self, DATA_HANDLE, HostState};
use crate::limiter::{LimitContext, classify, run_bounded};
use crate::monitor::ResourceMonitor;
use crate::permissions::ExecutionNamespace;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use stratguard_core::{
    ContentHash, Error, Invocation, MarketData, ResourceBudget, Result,
};
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Linker, Module, Store, WasmBacktraceDetails};

/// Background thread advancing the engine epoch.
///
/// Every store yields to the async runtime when the epoch moves, which is
/// what lets timeouts and cancellation preempt a guest that never returns.
#[derive(Debug)]
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("stratguard-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| Error::RuntimeError {
                message: format!("failed to start epoch ticker: {e}"),
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("epoch ticker thread panicked");
        }
    }
}

/// Execution metrics of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RuntimeStats {
    /// Executions started
    pub total_executions: u64,
    /// Executions that ended in any error
    pub execution_failures: u64,
    /// Executions aborted by a resource limit
    pub limit_breaches: u64,
    /// Executions cancelled by the caller
    pub cancellations: u64,
    /// Modules rejected by the engine
    pub compilation_failures: u64,
    /// Module cache hits
    pub cache_hits: u64,
    /// Module cache misses
    pub cache_misses: u64,
    /// Mean execution time in microseconds
    pub avg_execution_time_us: u64,
}

impl RuntimeStats {
    /// Module cache hit rate in `[0, 1]`, if any lookup happened.
    #[must_use]
    pub fn cache_hit_rate(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }
}

/// Wasmtime engine configured for bounded strategy execution.
///
/// `Send + Sync`; share it behind an `Arc` and run executions concurrently.
pub struct Sandbox {
    engine: Engine,
    config: SandboxConfig,
    module_cache: ModuleCache,
    _ticker: EpochTicker,

    total_executions: AtomicU64,
    execution_failures: AtomicU64,
    limit_breaches: AtomicU64,
    cancellations: AtomicU64,
    compilation_failures: AtomicU64,
    total_execution_time_us: AtomicU64,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("module_cache", &self.module_cache)
            .field(
                "total_executions",
                &self.total_executions.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Creates the engine and starts its epoch ticker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeError`] if the engine cannot be configured.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.wasm_backtrace_details(WasmBacktraceDetails::Enable);
        wasmtime_config.async_support(true);
        wasmtime_config.strategy(wasmtime::Strategy::Cranelift);
        wasmtime_config.consume_fuel(true);
        wasmtime_config.epoch_interruption(true);

        let engine = Engine::new(&wasmtime_config).map_err(|e| Error::RuntimeError {
            message: format!("failed to create Wasmtime engine: {e}"),
        })?;
        let ticker = EpochTicker::spawn(engine.clone(), config.epoch_tick())?;
        tracing::debug!(
            fuel_per_cpu_second = config.fuel_per_cpu_second(),
            epoch_tick_ms = config.epoch_tick().as_millis(),
            "sandbox engine ready"
        );

        Ok(Self {
            module_cache: ModuleCache::new(config.module_cache_size()),
            engine,
            config,
            _ticker: ticker,
            total_executions: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            limit_breaches: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            compilation_failures: AtomicU64::new(0),
            total_execution_time_us: AtomicU64::new(0),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compiled module cache.
    #[must_use]
    pub const fn module_cache(&self) -> &ModuleCache {
        &self.module_cache
    }

    /// Compiles WASM bytes to a native module, reusing a cached one when the
    /// same bytes were compiled before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompilationError`] if the engine rejects the module.
    pub fn compile(&self, wasm: &[u8]) -> Result<Module> {
        let key = ContentHash::of_bytes(wasm);
        if let Some(module) = self.module_cache.get(&key) {
            tracing::debug!(key = %key, "using cached module");
            return Ok(module);
        }

        let started = Instant::now();
        let module = Module::new(&self.engine, wasm).map_err(|e| {
            self.compilation_failures.fetch_add(1, Ordering::Relaxed);
            Error::CompilationError {
                message: format!("failed to compile module: {e}"),
                line: None,
            }
        })?;
        tracing::info!(
            bytes = wasm.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "module compiled"
        );
        self.module_cache.insert(key, module.clone());
        Ok(module)
    }

    /// Runs `entry` of `module` on `data` within `budget`.
    ///
    /// Host imports are linked from `namespace`. The entry must have type
    /// `(f64) -> f64`, take the market data handle and return a signal map.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceLimitExceeded`] on a CPU, memory or wall-clock breach
    /// - [`Error::Cancelled`] if `cancel` fires
    /// - [`Error::ExecutionFailed`] if the guest traps or returns a non-map
    pub async fn execute(
        &self,
        module: &Module,
        namespace: &ExecutionNamespace,
        entry: &str,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        let outcome = self.run(module, namespace, entry, data, budget, cancel).await;
        if let Err(err) = &outcome {
            self.execution_failures.fetch_add(1, Ordering::Relaxed);
            if err.is_resource_limit() {
                self.limit_breaches.fetch_add(1, Ordering::Relaxed);
            } else if err.is_cancelled() {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    async fn run(
        &self,
        module: &Module,
        namespace: &ExecutionNamespace,
        entry: &str,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        let fuel = budget.fuel(self.config.fuel_per_cpu_second());
        let context = LimitContext {
            cpu_seconds: budget.cpu_seconds(),
            fuel,
            memory_bytes: budget.memory_bytes(),
        };
        let monitor = ResourceMonitor::start(fuel);

        let mut store = Store::new(&self.engine, HostState::new(data, budget.memory_bytes()));
        store.limiter(|state| state.memory_mut());
        store.set_fuel(fuel).map_err(|e| Error::RuntimeError {
            message: format!("failed to set fuel: {e}"),
        })?;
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let mut linker = Linker::new(&self.engine);
        host::link(&mut linker, namespace)?;

        let call = async {
            let instance = linker
                .instantiate_async(&mut store, module)
                .await
                .map_err(|e| classify(&e, &context))?;
            let func = instance
                .get_typed_func::<f64, f64>(&mut store, entry)
                .map_err(|e| Error::ExecutionFailed {
                    message: format!("entry point '{entry}' unavailable: {e}"),
                })?;
            let handle = func
                .call_async(&mut store, DATA_HANDLE)
                .await
                .map_err(|e| classify(&e, &context))?;
            store.data_mut().take_signals(handle)
        };
        let outcome = run_bounded(call, budget.wall_clock(), cancel).await;

        monitor.record_fuel_remaining(store.get_fuel().unwrap_or(0));
        monitor.record_peak_memory(store.data().peak_memory());
        monitor.record_host_calls(store.data().host_calls());
        let usage = monitor.usage();
        self.total_execution_time_us
            .fetch_add(usage.elapsed_us, Ordering::Relaxed);

        match &outcome {
            Ok(signals) => tracing::debug!(
                entry,
                signals = signals.len(),
                usage = %monitor.summary(),
                "execution finished"
            ),
            Err(err) => tracing::warn!(entry, error = %err, usage = %monitor.summary(), "execution aborted"),
        }

        outcome.map(|output| Invocation { output, usage })
    }

    /// Snapshot of execution and cache counters.
    #[must_use]
    pub fn collect_stats(&self) -> RuntimeStats {
        let total_executions = self.total_executions.load(Ordering::Relaxed);
        let total_time = self.total_execution_time_us.load(Ordering::Relaxed);
        RuntimeStats {
            total_executions,
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            limit_breaches: self.limit_breaches.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            compilation_failures: self.compilation_failures.load(Ordering::Relaxed),
            cache_hits: self.module_cache.hits(),
            cache_misses: self.module_cache.misses(),
            avg_execution_time_us: total_time.checked_div(total_executions).unwrap_or(0),
        }
    }
}
