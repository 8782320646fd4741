//! `stratguard analyze`: static analysis of a strategy file.

use super::read_source;
use crate::formatters::{format_output, risk_badge};
use crate::{ExitCode, OutputFormat};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use stratguard_core::{ContentHash, GuardConfig, RiskLevel, Violation};
use stratguard_script::CodeSanitizer;
use tracing::info;

/// Analysis result for one file.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeView {
    /// File analyzed
    pub file: String,
    /// Hash of the file's contents
    pub code_hash: ContentHash,
    /// Mode the verdict was computed in
    pub strict_mode: bool,
    /// Whether a loader in this mode would accept the code
    pub admitted: bool,
    /// Highest severity found
    pub risk_level: RiskLevel,
    /// Findings in source order
    pub violations: Vec<Violation>,
}

/// Runs the sanitizer over `file` with the configured module allow-list.
pub fn analyze(file: &Path, strict_mode: bool, config: &GuardConfig) -> Result<AnalyzeView> {
    let source = read_source(file)?;
    let sanitizer = CodeSanitizer::with_allowed_modules(config.policy.modules.iter().cloned());
    let report = sanitizer.analyze(&source, strict_mode);
    info!(
        file = %file.display(),
        risk = %report.risk_level(),
        violations = report.violations().len(),
        "analysis complete"
    );
    Ok(AnalyzeView {
        file: file.display().to_string(),
        code_hash: ContentHash::of(&source),
        strict_mode,
        admitted: report.admits(),
        risk_level: report.risk_level(),
        violations: report.violations().to_vec(),
    })
}

/// Prints the analysis. Exits with [`ExitCode::REJECTED`] when a loader
/// would refuse the code.
pub fn run(
    file: &Path,
    strict_mode: bool,
    config: &GuardConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    let view = analyze(file, strict_mode, config)?;
    match format {
        OutputFormat::Json => println!("{}", format_output(&view, format)?),
        OutputFormat::Pretty => print_pretty(&view),
    }
    Ok(if view.admitted {
        ExitCode::SUCCESS
    } else {
        ExitCode::REJECTED
    })
}

fn print_pretty(view: &AnalyzeView) {
    let mode = if view.strict_mode { "strict" } else { "lenient" };
    println!("{} ({mode} mode)", view.file.bold());
    println!("  risk:   {}", risk_badge(view.risk_level));
    println!(
        "  result: {}",
        if view.admitted {
            "admitted".green()
        } else {
            "rejected".red()
        }
    );
    if view.violations.is_empty() {
        return;
    }
    println!();
    for v in &view.violations {
        println!(
            "  {:>4}:{:<3} {} {} {}",
            v.line,
            v.column,
            risk_badge(v.severity),
            v.kind.as_str().dimmed(),
            v.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source_file(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_safe_file_is_admitted() {
        let file = source_file("class Flat:\n    def generate_signals(self, data):\n        return {}\n");
        let view = analyze(file.path(), true, &GuardConfig::default()).unwrap();
        assert!(view.admitted);
        assert_eq!(view.risk_level, RiskLevel::Safe);
        assert!(view.violations.is_empty());
    }

    #[test]
    fn test_os_import_is_rejected() {
        let file = source_file("import os\nos.system('ls')\n");
        let view = analyze(file.path(), false, &GuardConfig::default()).unwrap();
        assert!(!view.admitted);
        assert_eq!(view.risk_level, RiskLevel::Critical);

        let code = run(file.path(), false, &GuardConfig::default(), OutputFormat::Json).unwrap();
        assert_eq!(code, ExitCode::REJECTED);
    }
}
