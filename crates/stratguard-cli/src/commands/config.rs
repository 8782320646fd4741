//! `stratguard config`: show where configuration comes from and what it
//! resolves to.
//!
//! Configuration is TOML, read from `--config`, `STRATGUARD_CONFIG`, or
//! `<config dir>/stratguard/config.toml`, with `STRATGUARD_*` variables
//! applied on top.

use super::ConfigSource;
use crate::formatters::format_output;
use crate::{ExitCode, OutputFormat};
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use stratguard_core::GuardConfig;

#[derive(Debug, Serialize)]
struct ConfigSummary<'a> {
    source: String,
    default_path: Option<String>,
    strict_mode: bool,
    config: Option<&'a GuardConfig>,
}

/// Prints the configuration source, and the full configuration with
/// `--show`.
pub fn run(
    config: &GuardConfig,
    source: &ConfigSource,
    show: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let default_path = GuardConfig::default_path().map(|p| p.display().to_string());
    match format {
        OutputFormat::Json => {
            let summary = ConfigSummary {
                source: source.describe(),
                default_path,
                strict_mode: config.strict_mode,
                config: show.then_some(config),
            };
            println!("{}", format_output(&summary, format)?);
        }
        OutputFormat::Pretty => {
            println!("{} {}", "source:".bold(), source.describe());
            if let Some(path) = default_path {
                println!("{} {path}", "default path:".bold());
            }
            if show {
                let text = config
                    .to_toml_string()
                    .context("failed to render configuration")?;
                println!();
                print!("{text}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
