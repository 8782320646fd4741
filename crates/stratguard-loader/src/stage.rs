//! Load pipeline stages.
//!
//! ```text
//! Received -> Hashed -> Sanitized -> Rejected
//!                                 -> NamespaceBuilt -> Compiled -> ClassValidated -> Ready
//! ```

use serde::Serialize;
use std::fmt;
use stratguard_audit::AuditEventType;
use stratguard_core::Error;

/// Position of one load in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    /// Record accepted
    Received,
    /// Content hash computed
    Hashed,
    /// Sanitizer report produced
    Sanitized,
    /// Sanitizer refused the code
    Rejected,
    /// Restricted namespace resolved
    NamespaceBuilt,
    /// WASM module produced
    Compiled,
    /// Declared class and exports checked against the contract
    ClassValidated,
    /// Instance handed to the caller
    Ready,
}

impl LoadStage {
    /// snake_case label used in audit detail.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Hashed => "hashed",
            Self::Sanitized => "sanitized",
            Self::Rejected => "rejected",
            Self::NamespaceBuilt => "namespace_built",
            Self::Compiled => "compiled",
            Self::ClassValidated => "class_validated",
            Self::Ready => "ready",
        }
    }

    /// Whether the pipeline stops here.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ready)
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed load with the last stage it reached.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    /// Last stage reached
    pub stage: LoadStage,
    /// Cause
    pub error: Error,
}

impl LoadFailure {
    /// Wraps `error` raised after `stage`.
    #[must_use]
    pub const fn new(stage: LoadStage, error: Error) -> Self {
        Self { stage, error }
    }

    /// Terminal audit event for this failure: permission and sanitizer
    /// rejections are security violations, everything else is a denial.
    #[must_use]
    pub const fn event_type(&self) -> AuditEventType {
        if self.error.is_security_violation() {
            AuditEventType::SecurityViolation
        } else {
            AuditEventType::LoadDenied
        }
    }

    /// Audit outcome label.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match &self.error {
            Error::SecurityViolation { report: Some(_), .. } => "sanitizer_rejected",
            Error::SecurityViolation { report: None, .. } => "permission_denied",
            Error::CompilationError { .. } => "compilation_failed",
            Error::ValidationError { .. } => "invalid_parameters",
            Error::NotFound { .. } => "class_not_registered",
            _ => "failed",
        }
    }
}

impl From<LoadFailure> for Error {
    fn from(failure: LoadFailure) -> Self {
        failure.error
    }
}
