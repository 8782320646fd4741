//! Sandboxed execution of untrusted strategies.
//!
//! Provides the permission namespace, the compiler from strategy script to
//! WASM and a Wasmtime sandbox that enforces CPU, memory and wall-clock
//! budgets per execution.
//!
//! # Architecture
//!
//! 1. `permissions` - Resolves a policy into an [`ExecutionNamespace`]
//! 2. `codegen` - Compiles a parsed class against that namespace
//! 3. `sandbox` - Compiles modules and runs them with fresh stores
//! 4. `limiter` / `host` - Budget enforcement and host imports
//! 5. `strategy` - [`WasmStrategy`], the executable class handed to loaders
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratguard_core::{MarketData, ResourceBudget, StrategyContract, StrategyOp};
//! use stratguard_core::traits::StrategyClass;
//! use stratguard_runtime::{PermissionPolicy, Sandbox, SandboxConfig, WasmStrategy};
//! use stratguard_runtime::{build_namespace, codegen};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> stratguard_core::Result<()> {
//! let source = "class Flat:\n    def generate_signals(self, data):\n        return {0: 0}\n";
//! let module = stratguard_script::parse(source).expect("valid source");
//! let namespace = Arc::new(build_namespace(&PermissionPolicy::default()));
//! let compiled = codegen::compile(&module, "Flat", &namespace, &StrategyContract::standard())?;
//!
//! let sandbox = Arc::new(Sandbox::new(SandboxConfig::default())?);
//! let strategy = WasmStrategy::new(sandbox, namespace, compiled, Arc::from(source))?;
//! let data = Arc::new(MarketData::from_closes(vec![1.0, 2.0]));
//! let budget = ResourceBudget::new(1.0, 16 << 20, 5.0)?;
//! let result = strategy
//!     .invoke(StrategyOp::GenerateSignals, data, budget, CancellationToken::new())
//!     .await?;
//! assert_eq!(result.output.get(&0), Some(&0.0));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod cache;
pub mod codegen;
pub mod config;
pub mod host;
pub mod limiter;
pub mod monitor;
pub mod permissions;
pub mod sandbox;
pub mod strategy;

pub use codegen::CompiledStrategy;
pub use config::SandboxConfig;
pub use permissions::{
    Capability, Decision, DenyReason, ExecutionNamespace, Operation, PermissionChecker,
    PermissionPolicy, build_namespace,
};
pub use sandbox::{RuntimeStats, Sandbox};
pub use strategy::WasmStrategy;
