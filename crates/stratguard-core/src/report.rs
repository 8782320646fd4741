//! Risk levels, sanitizer findings and the sanitization report.
//!
//! A [`SanitizationReport`] is created once per analysis and never mutated
//! afterwards; its fields are only reachable through accessors.
//!
//! # Examples
//!
//! ```
//! use stratguard_core::report::{RiskLevel, SanitizationReport, Violation, ViolationKind};
//!
//! let finding = Violation::new(
//!     ViolationKind::RestrictedImport,
//!     RiskLevel::Medium,
//!     "import of reflection module 'inspect'",
//!     1,
//!     1,
//! );
//! let lenient = SanitizationReport::new(vec![finding.clone()], false);
//! assert_eq!(lenient.risk_level(), RiskLevel::Medium);
//! assert!(!lenient.passed());
//! assert!(lenient.admits());
//!
//! let strict = SanitizationReport::new(vec![finding], true);
//! assert!(!strict.admits());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordinal severity classification of analyzed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No findings.
    Safe,
    /// Informational findings.
    Low,
    /// Non-destructive reflection or introspection.
    Medium,
    /// Access that can reach outside the strategy surface.
    High,
    /// Process, filesystem or interpreter escape, or unparseable code.
    Critical,
}

impl RiskLevel {
    /// Returns the lowercase label used in reports and audit records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether a loader admits code at this level.
    ///
    /// Strict mode admits only [`RiskLevel::Safe`]; lenient mode rejects
    /// [`RiskLevel::High`] and [`RiskLevel::Critical`].
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::RiskLevel;
    ///
    /// assert!(RiskLevel::Safe.admits(true));
    /// assert!(!RiskLevel::Low.admits(true));
    /// assert!(RiskLevel::Medium.admits(false));
    /// assert!(!RiskLevel::High.admits(false));
    /// ```
    #[must_use]
    pub fn admits(self, strict_mode: bool) -> bool {
        if strict_mode {
            self == Self::Safe
        } else {
            self < Self::High
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown risk level '{other}'"
            ))),
        }
    }
}

/// Category of a sanitizer finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Source could not be parsed.
    SyntaxError,
    /// Import of a process, filesystem or network module.
    ForbiddenImport,
    /// Import of a module outside the whitelist that is not itself dangerous.
    RestrictedImport,
    /// Dynamic evaluation or environment primitive (`eval`, `open`, ...).
    DynamicEval,
    /// Reflection that can traverse the object graph.
    Reflection,
    /// Destructive method name on an arbitrary receiver.
    DangerousCall,
    /// Direct use of an operating-system module member.
    OsPrimitive,
    /// Scope manipulation (`global`, `nonlocal`).
    UnsupportedScope,
}

impl ViolationKind {
    /// Returns the snake_case rule name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyntaxError => "syntax_error",
            Self::ForbiddenImport => "forbidden_import",
            Self::RestrictedImport => "restricted_import",
            Self::DynamicEval => "dynamic_eval",
            Self::Reflection => "reflection",
            Self::DangerousCall => "dangerous_call",
            Self::OsPrimitive => "os_primitive",
            Self::UnsupportedScope => "unsupported_scope",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding produced by static analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule that produced the finding
    pub kind: ViolationKind,
    /// Severity of the finding
    pub severity: RiskLevel,
    /// Description in policy terms
    pub message: String,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
}

impl Violation {
    /// Creates a new finding.
    #[must_use]
    pub fn new(
        kind: ViolationKind,
        severity: RiskLevel,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}:{} [{}/{}] {}",
            self.line, self.column, self.severity, self.kind, self.message
        )
    }
}

/// Outcome of analyzing one source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationReport {
    violations: Vec<Violation>,
    risk_level: RiskLevel,
    passed: bool,
    strict_mode: bool,
}

impl SanitizationReport {
    /// Builds a report from findings.
    ///
    /// `risk_level` is the maximum severity observed. `passed` is
    /// `risk_level < medium` in lenient mode and `risk_level == safe` in
    /// strict mode.
    #[must_use]
    pub fn new(violations: Vec<Violation>, strict_mode: bool) -> Self {
        let risk_level = violations
            .iter()
            .map(|v| v.severity)
            .max()
            .unwrap_or(RiskLevel::Safe);
        let passed = if strict_mode {
            risk_level == RiskLevel::Safe
        } else {
            risk_level < RiskLevel::Medium
        };
        Self {
            violations,
            risk_level,
            passed,
            strict_mode,
        }
    }

    /// Findings in source order.
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Maximum severity observed.
    #[must_use]
    pub const fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    /// Whether the report passed under its mode.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.passed
    }

    /// Mode the analysis ran in.
    #[must_use]
    pub const fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Whether a loader may proceed past sanitization.
    ///
    /// Equal to [`passed`](Self::passed) except that lenient mode also admits
    /// medium-risk code (with warnings).
    #[must_use]
    pub fn admits(&self) -> bool {
        self.risk_level.admits(self.strict_mode)
    }

    /// Findings rendered as warning strings.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }

    /// One-line summary for logs and audit detail.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.violations.is_empty() {
            return "risk=safe, no findings".to_string();
        }
        let first = &self.violations[0];
        format!(
            "risk={}, {} finding(s), first: {}",
            self.risk_level,
            self.violations.len(),
            first
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: RiskLevel) -> Violation {
        Violation::new(ViolationKind::Reflection, severity, "x", 1, 1)
    }

    #[test]
    fn test_empty_report_is_safe() {
        let report = SanitizationReport::new(Vec::new(), true);
        assert_eq!(report.risk_level(), RiskLevel::Safe);
        assert!(report.passed());
        assert!(report.admits());
        assert_eq!(report.summary(), "risk=safe, no findings");
    }

    #[test]
    fn test_risk_is_maximum_severity() {
        let report = SanitizationReport::new(
            vec![
                finding(RiskLevel::Low),
                finding(RiskLevel::Critical),
                finding(RiskLevel::Medium),
            ],
            false,
        );
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        assert_eq!(report.violations().len(), 3);
    }

    #[test]
    fn test_lenient_passed_below_medium() {
        let low = SanitizationReport::new(vec![finding(RiskLevel::Low)], false);
        assert!(low.passed());
        let medium = SanitizationReport::new(vec![finding(RiskLevel::Medium)], false);
        assert!(!medium.passed());
        assert!(medium.admits());
    }

    #[test]
    fn test_strict_requires_safe() {
        let low = SanitizationReport::new(vec![finding(RiskLevel::Low)], true);
        assert!(!low.passed());
        assert!(!low.admits());
    }

    #[test]
    fn test_risk_level_ordering_and_parse() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!("HIGH".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("extreme".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_risk_level_serializes_lowercase() {
        let json = serde_json::to_string(&RiskLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }

    #[test]
    fn test_warnings_render_location() {
        let report = SanitizationReport::new(
            vec![Violation::new(
                ViolationKind::RestrictedImport,
                RiskLevel::Low,
                "import of 'json'",
                4,
                1,
            )],
            false,
        );
        let warnings = report.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("line 4:1"));
        assert!(warnings[0].contains("restricted_import"));
    }
}
