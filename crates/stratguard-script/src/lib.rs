//! Strategy script front end.
//!
//! Strategy sources are written in a small, indentation-structured scripting
//! language. This crate turns source text into a syntax tree and scores it
//! for security risk before anything is compiled or executed.
//!
//! # Architecture
//!
//! 1. `lexer` - Tokenizes source, tracking indentation
//! 2. `parser` - Builds an [`ast::Module`] with recursion limits
//! 3. `sanitizer` - Walks the tree and produces a [`SanitizationReport`]
//!
//! # Examples
//!
//! ```
//! use stratguard_script::{CodeSanitizer, RiskLevel};
//!
//! let source = "\
//! class Momentum:
//!     def generate_signals(self, data):
//!         return {0: 1.0}
//! ";
//! let analysis = CodeSanitizer::new().inspect(source, true);
//! assert_eq!(analysis.report.risk_level(), RiskLevel::Safe);
//! assert!(analysis.module.is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod ast;
pub mod lexer;
mod parser;
mod sanitizer;

pub use parser::{MAX_NESTING_DEPTH, MAX_SOURCE_BYTES, is_keyword, parse};
pub use sanitizer::{
    Analysis, CodeSanitizer, DEFAULT_ALLOWED_MODULES, ESCAPE_ATTRIBUTES, EVAL_PRIMITIVES,
    IO_MODULES, PROCESS_MODULES, REFLECTION_MODULES, analyze,
};
pub use stratguard_core::{RiskLevel, SanitizationReport, Violation, ViolationKind};

/// Source text that could not be tokenized or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}:{column}: {message}")]
pub struct SyntaxError {
    /// What went wrong
    pub message: String,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
}

impl SyntaxError {
    /// Creates a syntax error at a position.
    #[must_use]
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

impl From<SyntaxError> for stratguard_core::Error {
    fn from(err: SyntaxError) -> Self {
        Self::CompilationError {
            message: err.message,
            line: Some(err.line),
        }
    }
}
