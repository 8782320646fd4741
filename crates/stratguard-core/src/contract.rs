//! The strategy contract every loaded class must satisfy.

use crate::types::StrategyOp;
use crate::{Error, Result};

/// Structural contract: which operations a strategy class must expose.
///
/// There is no inheritance check. A class conforms when it provides every
/// required operation with an entry-compatible signature.
///
/// # Examples
///
/// ```
/// use stratguard_core::{StrategyContract, StrategyOp};
///
/// let contract = StrategyContract::standard();
/// assert!(contract.check("S", &[StrategyOp::GenerateSignals]).is_ok());
/// assert!(contract.check("S", &[StrategyOp::CalculateScores]).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyContract {
    required: Vec<StrategyOp>,
    optional: Vec<StrategyOp>,
}

impl StrategyContract {
    /// `generate_signals` required, `calculate_scores` optional.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            required: vec![StrategyOp::GenerateSignals],
            optional: vec![StrategyOp::CalculateScores],
        }
    }

    /// Operations a class must provide.
    #[must_use]
    pub fn required(&self) -> &[StrategyOp] {
        &self.required
    }

    /// Whether the contract knows the operation at all.
    #[must_use]
    pub fn recognizes(&self, op: StrategyOp) -> bool {
        self.required.contains(&op) || self.optional.contains(&op)
    }

    /// Checks that `provided` covers every required operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompilationError`] naming the first missing operation.
    pub fn check(&self, class_name: &str, provided: &[StrategyOp]) -> Result<()> {
        match self.required.iter().find(|op| !provided.contains(op)) {
            Some(missing) => Err(Error::CompilationError {
                message: format!(
                    "class '{class_name}' does not implement required operation '{missing}'"
                ),
                line: None,
            }),
            None => Ok(()),
        }
    }
}

impl Default for StrategyContract {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_names_operation() {
        let err = StrategyContract::standard().check("Foo", &[]).unwrap_err();
        assert!(err.is_compilation_error());
        assert!(err.to_string().contains("generate_signals"));
        assert!(err.to_string().contains("Foo"));
    }

    #[test]
    fn test_all_ops_recognized() {
        let contract = StrategyContract::default();
        for op in StrategyOp::ALL {
            assert!(contract.recognizes(op));
        }
        assert_eq!(contract.required(), &[StrategyOp::GenerateSignals]);
    }
}
