//! Strategy guard CLI library.
//!
//! Exposes the command implementations and formatters behind the
//! `stratguard` binary so they can be tested without spawning a process.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::format_push_string)]

use clap::ValueEnum;
use std::fmt;

pub mod commands;
pub mod formatters;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum OutputFormat {
    /// JSON for machine parsing
    Json,
    /// Colorized, human-readable output
    #[default]
    Pretty,
}

impl OutputFormat {
    /// Name as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit code with semantic meaning.
///
/// # Examples
///
/// ```
/// use stratguard_cli::ExitCode;
///
/// assert!(ExitCode::SUCCESS.is_success());
/// assert_eq!(ExitCode::REJECTED.as_i32(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Command succeeded (0).
    pub const SUCCESS: Self = Self(0);

    /// Unclassified failure (1).
    pub const ERROR: Self = Self(1);

    /// Bad input file or argument (2).
    pub const INVALID_INPUT: Self = Self(2);

    /// Code rejected by the sanitizer or permission policy (3).
    pub const REJECTED: Self = Self(3);

    /// Execution hit a timeout, CPU or memory limit (4).
    pub const LIMIT_EXCEEDED: Self = Self(4);

    /// Audit chain or strategy integrity check failed (5).
    pub const INTEGRITY: Self = Self(5);

    /// Integer value passed to the OS.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether this is [`ExitCode::SUCCESS`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Exit code for a failed load or execution.
    #[must_use]
    pub const fn for_error(err: &stratguard_core::Error) -> Self {
        if err.is_security_violation() {
            Self::REJECTED
        } else if err.is_resource_limit() {
            Self::LIMIT_EXCEEDED
        } else if err.is_integrity_error() {
            Self::INTEGRITY
        } else if err.is_validation_error() || err.is_compilation_error() {
            Self::INVALID_INPUT
        } else {
            Self::ERROR
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
