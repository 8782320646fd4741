//! Output formatters shared by the commands.

use crate::OutputFormat;
use anyhow::Result;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use stratguard_core::RiskLevel;

/// Formats `data` as pretty JSON or as a colorized tree.
///
/// # Examples
///
/// ```
/// use stratguard_cli::OutputFormat;
/// use stratguard_cli::formatters::format_output;
///
/// let out = format_output(&serde_json::json!({"risk": "safe"}), OutputFormat::Json)?;
/// assert!(out.contains("\"risk\""));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn format_output<T: Serialize>(data: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
        OutputFormat::Pretty => pretty(data),
    }
}

/// Colorized rendering of any serializable value.
pub fn pretty<T: Serialize>(data: &T) -> Result<String> {
    let value = serde_json::to_value(data)?;
    let mut out = String::new();
    write_value(&mut out, &value, 0);
    Ok(out)
}

fn write_value(out: &mut String, value: &serde_json::Value, indent: usize) {
    use serde_json::Value;

    let pad = "  ".repeat(indent);
    match value {
        Value::Null => out.push_str(&"-".dimmed().to_string()),
        Value::Bool(b) => out.push_str(&b.to_string().yellow().to_string()),
        Value::Number(n) => out.push_str(&n.to_string().cyan().to_string()),
        Value::String(s) => out.push_str(&s.green().to_string()),
        Value::Array(items) if items.is_empty() => out.push_str(&"(none)".dimmed().to_string()),
        Value::Array(items) => {
            for item in items {
                out.push('\n');
                out.push_str(&pad);
                out.push_str("- ");
                write_value(out, item, indent + 1);
            }
        }
        Value::Object(map) if map.is_empty() => out.push_str(&"(empty)".dimmed().to_string()),
        Value::Object(map) => {
            for (key, val) in map {
                out.push('\n');
                out.push_str(&pad);
                out.push_str(&format!("{}: ", key.blue().bold()));
                write_value(out, val, indent + 1);
            }
        }
    }
}

/// Risk level colored by severity.
#[must_use]
pub fn risk_badge(level: RiskLevel) -> ColoredString {
    let label = level.as_str().to_uppercase();
    match level {
        RiskLevel::Safe => label.green().bold(),
        RiskLevel::Low => label.cyan().bold(),
        RiskLevel::Medium => label.yellow().bold(),
        RiskLevel::High | RiskLevel::Critical => label.red().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_format() {
        let out = format_output(&json!({"name": "mac", "bars": 3}), OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["bars"], 3);
    }

    #[test]
    fn test_pretty_lists_nested_keys() {
        colored::control::set_override(false);
        let out = pretty(&json!({"metadata": {"class_name": "Mac"}, "warnings": []})).unwrap();
        assert!(out.contains("metadata: "));
        assert!(out.contains("  class_name: Mac"));
        assert!(out.contains("warnings: (none)"));
    }

    #[test]
    fn test_risk_badge_label() {
        colored::control::set_override(false);
        assert_eq!(risk_badge(RiskLevel::Medium).to_string(), "MEDIUM");
    }
}
