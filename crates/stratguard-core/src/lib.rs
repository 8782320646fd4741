//! Core types, traits, configuration and errors for strategy loading.
//!
//! This crate provides the foundational types shared by the sanitizer, the
//! sandbox runtime, the loaders and the CLI.
//!
//! # Architecture
//!
//! The core consists of:
//! - Strong domain types (`StrategyId`, `ContentHash`, `ResourceBudget`)
//! - The error taxonomy with `is_*` predicates
//! - The sanitization report model shared by analyzer and loader
//! - Collaborator traits (`SourceStore`, `StrategyClass`)
//! - `GuardConfig`, the single configuration surface

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod contract;
mod error;
mod types;

pub mod hash;
pub mod report;
pub mod traits;

pub use config::{ENV_PREFIX, GuardConfig, GuardConfigBuilder, PolicyConfig};
pub use contract::StrategyContract;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use report::{RiskLevel, SanitizationReport, Violation, ViolationKind};
pub use types::{
    ExecutionLimits, Field, Invocation, LimitKind, MarketData, ResourceBudget, ResourceUsage,
    Signals, SourceType, StrategyId, StrategyOp, StrategySourceRecord,
};
