//! Subcommand implementations.
//!
//! Each command reads its inputs, calls into the library crates and prints
//! its result in the requested [`OutputFormat`](crate::OutputFormat).

pub mod analyze;
pub mod audit;
pub mod config;
pub mod run;

use anyhow::{Context, Result};
use std::path::Path;
use stratguard_audit::AuditLogger;
use stratguard_core::GuardConfig;
use tracing::debug;

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config` or `STRATGUARD_CONFIG`
    Explicit(String),
    /// The default location under the user's config directory
    DefaultFile(String),
    /// No file, built-in defaults
    Defaults,
}

impl ConfigSource {
    /// Label shown by `stratguard config`.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Explicit(path) | Self::DefaultFile(path) => path.clone(),
            Self::Defaults => "built-in defaults".to_string(),
        }
    }
}

/// Resolves the effective configuration: the explicit file if given, else
/// the default file if it exists, else defaults. `STRATGUARD_*`
/// environment variables are applied on top.
pub fn load_config(explicit: Option<&Path>) -> Result<(GuardConfig, ConfigSource)> {
    let (mut config, source) = match explicit {
        Some(path) => (
            GuardConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            ConfigSource::Explicit(path.display().to_string()),
        ),
        None => match GuardConfig::default_path().filter(|p| p.is_file()) {
            Some(path) => (
                GuardConfig::from_file(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                ConfigSource::DefaultFile(path.display().to_string()),
            ),
            None => (GuardConfig::default(), ConfigSource::Defaults),
        },
    };
    config
        .apply_env_overrides()
        .context("invalid STRATGUARD_* environment override")?;
    config.validate().context("invalid configuration")?;
    debug!(source = %source.describe(), "configuration resolved");
    Ok((config, source))
}

/// Sanitizer mode: `--strict` or `--lenient` when given, the configured
/// mode otherwise.
#[must_use]
pub const fn resolve_strictness(config: &GuardConfig, strict: bool, lenient: bool) -> bool {
    if strict {
        true
    } else if lenient {
        false
    } else {
        config.strict_mode
    }
}

/// Audit logger writing to the configured file, if any.
#[must_use]
pub fn audit_logger(config: &GuardConfig) -> AuditLogger {
    match &config.audit_log_path {
        Some(path) => AuditLogger::with_file(path, config.audit_buffer_capacity),
        None => AuditLogger::in_memory(config.audit_buffer_capacity),
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
