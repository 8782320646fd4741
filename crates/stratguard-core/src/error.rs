//! Error types for strategy loading and execution.
//!
//! The taxonomy separates failures that are fatal to a load
//! ([`Error::SecurityViolation`], [`Error::CompilationError`],
//! [`Error::IntegrityError`]), failures that are fatal to one execution only
//! ([`Error::ResourceLimitExceeded`], [`Error::Cancelled`],
//! [`Error::ExecutionFailed`]) and the non-fatal [`Error::CacheError`], which
//! loaders log and recover from without surfacing it to the caller.
//!
//! # Examples
//!
//! ```
//! use stratguard_core::{Error, Result};
//!
//! fn require_class(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(Error::CompilationError {
//!             message: "declared class name is empty".to_string(),
//!             line: None,
//!         });
//!     }
//!     Ok(())
//! }
//!
//! let err = require_class("").unwrap_err();
//! assert!(err.is_compilation_error());
//! assert!(err.is_fatal());
//! ```

use crate::report::SanitizationReport;
use crate::types::LimitKind;
use thiserror::Error;

/// Main error type for strategy loading and execution.
///
/// Every variant holds owned, cloneable data so that a single failed
/// compilation can be handed to every caller waiting on the same cache key.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Static analysis or the permission policy rejected the strategy.
    ///
    /// Carries the sanitization report when the rejection came from the
    /// sanitizer, so callers can see which findings caused it.
    #[error("Security policy violation: {reason}")]
    SecurityViolation {
        /// Description of the violation, phrased in policy terms
        reason: String,
        /// Sanitizer findings, when the sanitizer produced the rejection
        report: Option<Box<SanitizationReport>>,
    },

    /// The source failed to compile or the declared class is unusable.
    #[error("Compilation failed{}: {message}", line_suffix(.line))]
    CompilationError {
        /// Description of the compilation problem
        message: String,
        /// 1-based source line, when known
        line: Option<usize>,
    },

    /// Content hash recomputed at execution time differs from load time.
    #[error("Integrity check failed: expected {expected}, found {actual}")]
    IntegrityError {
        /// Hash recorded at load time
        expected: String,
        /// Hash observed now
        actual: String,
    },

    /// An execution exceeded its resource budget and was aborted.
    #[error("Resource limit exceeded ({limit}): {message}")]
    ResourceLimitExceeded {
        /// Which budget was exhausted
        limit: LimitKind,
        /// Human readable detail
        message: String,
    },

    /// Cache operation failed. Never fatal.
    #[error("Cache error: {message}")]
    CacheError {
        /// Description of the cache failure
        message: String,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Guest code trapped or returned a value outside the contract.
    #[error("Strategy execution failed: {message}")]
    ExecutionFailed {
        /// Description of the failure
        message: String,
    },

    /// A strategy parameter failed validation.
    #[error("Validation error in {field}: {reason}")]
    ValidationError {
        /// Parameter or field that failed validation
        field: String,
        /// Detailed reason
        reason: String,
    },

    /// Requested record or registered class does not exist.
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Identifier of the missing resource
        resource: String,
    },

    /// Configuration is invalid or could not be read.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration problem
        message: String,
    },

    /// Invalid argument passed to a public API.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The sandbox engine itself failed (setup, linking).
    #[error("Runtime error: {message}")]
    RuntimeError {
        /// Description of the engine failure
        message: String,
    },
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

impl Error {
    /// Returns `true` if this is a security violation.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::Error;
    ///
    /// let err = Error::SecurityViolation {
    ///     reason: "import of 'os' is not permitted".to_string(),
    ///     report: None,
    /// };
    /// assert!(err.is_security_violation());
    /// ```
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation { .. })
    }

    /// Returns `true` if this is a compilation error.
    #[must_use]
    pub const fn is_compilation_error(&self) -> bool {
        matches!(self, Self::CompilationError { .. })
    }

    /// Returns `true` if this is an integrity error.
    #[must_use]
    pub const fn is_integrity_error(&self) -> bool {
        matches!(self, Self::IntegrityError { .. })
    }

    /// Returns `true` if an execution was aborted by a resource limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::{Error, LimitKind};
    ///
    /// let err = Error::ResourceLimitExceeded {
    ///     limit: LimitKind::WallClock,
    ///     message: "exceeded 1.0s".to_string(),
    /// };
    /// assert!(err.is_resource_limit());
    /// assert_eq!(err.limit_kind(), Some(LimitKind::WallClock));
    /// ```
    #[must_use]
    pub const fn is_resource_limit(&self) -> bool {
        matches!(self, Self::ResourceLimitExceeded { .. })
    }

    /// Returns the exhausted limit for [`Error::ResourceLimitExceeded`].
    #[must_use]
    pub const fn limit_kind(&self) -> Option<LimitKind> {
        match self {
            Self::ResourceLimitExceeded { limit, .. } => Some(*limit),
            _ => None,
        }
    }

    /// Returns `true` if this is a cache error.
    #[must_use]
    pub const fn is_cache_error(&self) -> bool {
        matches!(self, Self::CacheError { .. })
    }

    /// Returns `true` if the operation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if this is a parameter validation error.
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(self, Self::ValidationError { .. })
    }

    /// Returns `true` if a record or class could not be found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a configuration error.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Returns `false` only for the recoverable [`Error::CacheError`].
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_cache_error()
    }

    /// Sanitization report attached to a security violation, if any.
    #[must_use]
    pub fn report(&self) -> Option<&SanitizationReport> {
        match self {
            Self::SecurityViolation { report, .. } => report.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias using the crate [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_error_display_with_line() {
        let err = Error::CompilationError {
            message: "class 'Foo' not found".to_string(),
            line: Some(3),
        };
        assert_eq!(
            err.to_string(),
            "Compilation failed at line 3: class 'Foo' not found"
        );
    }

    #[test]
    fn test_compilation_error_display_without_line() {
        let err = Error::CompilationError {
            message: "empty".to_string(),
            line: None,
        };
        assert_eq!(err.to_string(), "Compilation failed: empty");
    }

    #[test]
    fn test_resource_limit_display() {
        let err = Error::ResourceLimitExceeded {
            limit: LimitKind::Memory,
            message: "1048576 bytes".to_string(),
        };
        assert!(err.to_string().contains("memory"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cache_error_is_not_fatal() {
        let err = Error::CacheError {
            message: "slot abandoned".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.is_cache_error());
    }

    #[test]
    fn test_report_accessor() {
        let report = SanitizationReport::new(Vec::new(), true);
        let err = Error::SecurityViolation {
            reason: "x".to_string(),
            report: Some(Box::new(report)),
        };
        assert!(err.report().is_some());
        assert!(Error::InvalidArgument("y".into()).report().is_none());
    }

    #[test]
    fn test_error_is_clone() {
        let err = Error::NotFound {
            resource: "strategy:42".to_string(),
        };
        let cloned = err.clone();
        assert!(cloned.is_not_found());
    }
}
