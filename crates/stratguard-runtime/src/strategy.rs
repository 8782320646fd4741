//! Compiled strategy classes executed in the sandbox.

use crate::codegen::CompiledStrategy;
use crate::permissions::ExecutionNamespace;
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use std::sync::Arc;
use stratguard_core::traits::StrategyClass;
use stratguard_core::{
    ContentHash, Error, Invocation, MarketData, ResourceBudget, Result, StrategyOp,
};
use tokio_util::sync::CancellationToken;
use wasmtime::{ExternType, Module, ValType};

/// A strategy class compiled to WASM and bound to a sandbox.
///
/// The source text is retained so integrity can be re-checked after load.
#[derive(Debug)]
pub struct WasmStrategy {
    sandbox: Arc<Sandbox>,
    namespace: Arc<ExecutionNamespace>,
    module: Module,
    compiled: CompiledStrategy,
    source: Arc<str>,
}

impl WasmStrategy {
    /// Compiles `compiled` in `sandbox` and validates its exports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompilationError`] if the engine rejects the module or
    /// an exported operation does not have type `(f64) -> f64`.
    pub fn new(
        sandbox: Arc<Sandbox>,
        namespace: Arc<ExecutionNamespace>,
        compiled: CompiledStrategy,
        source: Arc<str>,
    ) -> Result<Self> {
        let module = sandbox.compile(&compiled.wasm)?;
        for op in &compiled.operations {
            check_export(&module, op.method_name())?;
        }
        Ok(Self {
            sandbox,
            namespace,
            module,
            compiled,
            source,
        })
    }

    /// Digest of the compiled module.
    #[must_use]
    pub const fn wasm_hash(&self) -> &ContentHash {
        &self.compiled.wasm_hash
    }

    /// Compiler output backing this class.
    #[must_use]
    pub const fn compiled(&self) -> &CompiledStrategy {
        &self.compiled
    }
}

fn check_export(module: &Module, name: &str) -> Result<()> {
    let Some(ExternType::Func(func)) = module.get_export(name) else {
        return Err(Error::CompilationError {
            message: format!("module does not export operation '{name}'"),
            line: None,
        });
    };
    let params: Vec<ValType> = func.params().collect();
    let results: Vec<ValType> = func.results().collect();
    if matches!(params.as_slice(), [ValType::F64]) && matches!(results.as_slice(), [ValType::F64]) {
        Ok(())
    } else {
        Err(Error::CompilationError {
            message: format!("operation '{name}' must have type (f64) -> f64"),
            line: None,
        })
    }
}

#[async_trait]
impl StrategyClass for WasmStrategy {
    fn class_name(&self) -> &str {
        &self.compiled.class_name
    }

    fn operations(&self) -> &[StrategyOp] {
        &self.compiled.operations
    }

    fn verify_integrity(&self, expected: &ContentHash) -> Result<()> {
        let source_hash = ContentHash::of(&self.source);
        if !source_hash.verify(expected) {
            return Err(Error::IntegrityError {
                expected: expected.to_string(),
                actual: source_hash.to_string(),
            });
        }
        let wasm_hash = ContentHash::of_bytes(&self.compiled.wasm);
        if !wasm_hash.verify(&self.compiled.wasm_hash) {
            return Err(Error::IntegrityError {
                expected: self.compiled.wasm_hash.to_string(),
                actual: wasm_hash.to_string(),
            });
        }
        Ok(())
    }

    async fn invoke(
        &self,
        op: StrategyOp,
        data: Arc<MarketData>,
        budget: ResourceBudget,
        cancel: CancellationToken,
    ) -> Result<Invocation> {
        if !self.compiled.operations.contains(&op) {
            return Err(Error::InvalidArgument(format!(
                "class '{}' does not implement {}",
                self.compiled.class_name,
                op.method_name()
            )));
        }
        self.sandbox
            .execute(
                &self.module,
                &self.namespace,
                op.method_name(),
                data,
                budget,
                &cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::compile;
    use crate::config::SandboxConfig;
    use crate::permissions::{PermissionPolicy, build_namespace};
    use stratguard_core::StrategyContract;

    const SOURCE: &str = "
class LastClose:
    def generate_signals(self, data):
        return {len(data) - 1: data[-1]}
";

    fn strategy(source: &str) -> WasmStrategy {
        let module = stratguard_script::parse(source).unwrap();
        let namespace = Arc::new(build_namespace(&PermissionPolicy::default()));
        let compiled =
            compile(&module, "LastClose", &namespace, &StrategyContract::standard()).unwrap();
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::default()).unwrap());
        WasmStrategy::new(sandbox, namespace, compiled, Arc::from(source)).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_generate_signals() {
        let strategy = strategy(SOURCE);
        let data = Arc::new(MarketData::from_closes(vec![1.0, 2.0, 3.5]));
        let budget = ResourceBudget::new(1.0, 16 * 1024 * 1024, 5.0).unwrap();
        let result = strategy
            .invoke(StrategyOp::GenerateSignals, data, budget, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output.get(&2), Some(&3.5));
        assert!(result.usage.fuel_consumed > 0);
    }

    #[tokio::test]
    async fn test_missing_operation_is_invalid_argument() {
        let strategy = strategy(SOURCE);
        let data = Arc::new(MarketData::from_closes(vec![1.0]));
        let budget = ResourceBudget::new(1.0, 1024 * 1024, 1.0).unwrap();
        let err = strategy
            .invoke(StrategyOp::CalculateScores, data, budget, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_verify_integrity() {
        let strategy = strategy(SOURCE);
        assert!(strategy.verify_integrity(&ContentHash::of(SOURCE)).is_ok());
        let err = strategy
            .verify_integrity(&ContentHash::of("class Other: pass"))
            .unwrap_err();
        assert!(err.is_integrity_error());
    }

    #[test]
    fn test_export_type_is_checked() {
        let sandbox = Sandbox::new(SandboxConfig::default()).unwrap();
        let wasm = wat::parse_str(
            r#"(module (func (export "generate_signals") (param i32) (result f64) f64.const 0))"#,
        )
        .unwrap();
        let module = sandbox.compile(&wasm).unwrap();
        let err = check_export(&module, "generate_signals").unwrap_err();
        assert!(err.to_string().contains("(f64) -> f64"));
        assert!(check_export(&module, "calculate_scores").is_err());
    }
}
