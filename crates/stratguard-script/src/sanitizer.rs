//! Static security analysis of strategy scripts.
//!
//! The sanitizer walks the syntax tree (never the raw text) and scores
//! every construct that can reach outside the strategy surface. It is a pure
//! function of its input and never fails: unparseable code is itself a
//! critical finding.

use crate::ast::{self, Expr, ExprKind, Module, Param, Stmt, StmtKind, Visitor};
use crate::parse;
use std::collections::{HashMap, HashSet};
use stratguard_core::{RiskLevel, SanitizationReport, Violation, ViolationKind};

/// Process, OS and interpreter modules.
pub const PROCESS_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "ctypes",
    "importlib",
    "builtins",
    "pickle",
    "marshal",
    "pty",
    "signal",
    "multiprocessing",
];

/// Network and filesystem modules.
pub const IO_MODULES: &[&str] = &[
    "socket",
    "urllib",
    "requests",
    "http",
    "ftplib",
    "smtplib",
    "pathlib",
    "tempfile",
    "glob",
    "io",
    "threading",
    "asyncio",
];

/// Reflection and introspection modules.
pub const REFLECTION_MODULES: &[&str] = &[
    "inspect",
    "gc",
    "types",
    "code",
    "codeop",
    "dis",
    "ast",
    "traceback",
];

/// Dynamic evaluation and environment primitives.
pub const EVAL_PRIMITIVES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "open",
    "input",
    "breakpoint",
    "memoryview",
];

/// Attributes that lead from any object to the interpreter internals.
pub const ESCAPE_ATTRIBUTES: &[&str] = &[
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__bases__",
    "__base__",
    "__mro__",
    "__code__",
    "__closure__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__loader__",
    "__spec__",
    "f_globals",
    "f_locals",
    "f_back",
    "gi_frame",
    "tb_frame",
    "cr_frame",
];

const OBJECT_INTERNALS: &[&str] = &["__class__", "__dict__"];
const ATTRIBUTE_FUNCTIONS: &[&str] = &["getattr", "setattr", "delattr"];
const INTROSPECTION_FUNCTIONS: &[&str] = &["type", "vars", "dir", "id"];
const TYPE_CHECKS: &[&str] = &["hasattr", "isinstance", "issubclass"];

const DESTRUCTIVE_METHODS: &[&str] = &[
    "system", "popen", "fork", "kill", "remove", "unlink", "rmdir", "rmtree", "chmod", "chown",
];

/// Modules importable without a finding.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &["math", "typing"];

/// Result of analyzing one source text: the report plus the parsed module
/// when parsing succeeded.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Findings and verdict
    pub report: SanitizationReport,
    /// Syntax tree, `None` if the source did not parse
    pub module: Option<Module>,
}

/// Syntax-tree security analyzer.
///
/// # Examples
///
/// ```
/// use stratguard_core::RiskLevel;
/// use stratguard_script::CodeSanitizer;
///
/// let sanitizer = CodeSanitizer::new();
/// let report = sanitizer.analyze("import os\nos.system('rm -rf /')\n", false);
/// assert_eq!(report.risk_level(), RiskLevel::Critical);
/// assert!(!report.passed());
///
/// let report = sanitizer.analyze("import math\nx = math.sqrt(2)\n", true);
/// assert_eq!(report.risk_level(), RiskLevel::Safe);
/// ```
#[derive(Debug, Clone)]
pub struct CodeSanitizer {
    allowed_modules: HashSet<String>,
}

impl Default for CodeSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSanitizer {
    /// Creates a sanitizer that allows [`DEFAULT_ALLOWED_MODULES`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_allowed_modules(DEFAULT_ALLOWED_MODULES.iter().copied())
    }

    /// Creates a sanitizer with a custom module whitelist. Modules in the
    /// dangerous categories are scored regardless of the whitelist.
    #[must_use]
    pub fn with_allowed_modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_modules: modules.into_iter().map(Into::into).collect(),
        }
    }

    /// Analyzes source text.
    #[must_use]
    pub fn analyze(&self, source: &str, strict_mode: bool) -> SanitizationReport {
        self.inspect(source, strict_mode).report
    }

    /// Analyzes source text and keeps the syntax tree for compilation.
    #[must_use]
    pub fn inspect(&self, source: &str, strict_mode: bool) -> Analysis {
        let (violations, module) = match parse(source) {
            Ok(module) => {
                let mut scan = Scan::new(&self.allowed_modules);
                scan.walk_scope(&module.body, &[]);
                (scan.finish(), Some(module))
            }
            Err(err) => (
                vec![Violation::new(
                    ViolationKind::SyntaxError,
                    RiskLevel::Critical,
                    format!("source does not parse: {}", err.message),
                    err.line,
                    err.column,
                )],
                None,
            ),
        };
        let report = SanitizationReport::new(violations, strict_mode);
        tracing::debug!(
            risk = %report.risk_level(),
            findings = report.violations().len(),
            strict_mode,
            "sanitized strategy source"
        );
        Analysis { report, module }
    }
}

/// Analyzes with the default whitelist.
#[must_use]
pub fn analyze(source: &str, strict_mode: bool) -> SanitizationReport {
    CodeSanitizer::new().analyze(source, strict_mode)
}

fn classify_module(root: &str, allowed: &HashSet<String>) -> Option<(ViolationKind, RiskLevel)> {
    if PROCESS_MODULES.contains(&root) {
        Some((ViolationKind::ForbiddenImport, RiskLevel::Critical))
    } else if IO_MODULES.contains(&root) {
        Some((ViolationKind::ForbiddenImport, RiskLevel::High))
    } else if REFLECTION_MODULES.contains(&root) {
        Some((ViolationKind::RestrictedImport, RiskLevel::Medium))
    } else if allowed.contains(root) {
        None
    } else {
        Some((ViolationKind::RestrictedImport, RiskLevel::Low))
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn is_destructive(attr: &str) -> bool {
    DESTRUCTIVE_METHODS.contains(&attr)
        || attr.starts_with("spawn")
        || attr
            .strip_prefix("exec")
            .is_some_and(|rest| rest.chars().all(|c| matches!(c, 'l' | 'v' | 'p' | 'e')))
}

/// Names a block binds in its own scope. Nested function and class bodies,
/// lambdas and comprehensions are scopes of their own and are not entered.
#[derive(Default)]
struct Bindings {
    names: HashSet<String>,
}

impl Bindings {
    fn of(body: &[Stmt], params: &[Param]) -> HashSet<String> {
        let mut bindings = Self::default();
        bindings.names.extend(params.iter().map(|p| p.name.clone()));
        for stmt in body {
            bindings.visit_stmt(stmt);
        }
        bindings.names
    }

    fn target(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => {
                self.names.insert(name.clone());
            }
            ExprKind::Tuple(parts) | ExprKind::List(parts) => {
                for part in parts {
                    self.target(part);
                }
            }
            ExprKind::Starred(inner) => self.target(inner),
            _ => {}
        }
    }
}

impl Visitor for Bindings {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef(func) => {
                self.names.insert(func.name.clone());
                return;
            }
            StmtKind::ClassDef(class) => {
                self.names.insert(class.name.clone());
                return;
            }
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    self.target(target);
                }
            }
            StmtKind::AnnAssign { target, .. }
            | StmtKind::AugAssign { target, .. }
            | StmtKind::For { target, .. } => self.target(target),
            StmtKind::With { items, .. } => {
                for target in items.iter().filter_map(|(_, target)| target.as_ref()) {
                    self.target(target);
                }
            }
            StmtKind::Try { handlers, .. } => {
                self.names
                    .extend(handlers.iter().filter_map(|h| h.name.clone()));
            }
            // Process imports re-bind their alias when the scan reaches them.
            StmtKind::Import(aliases) => {
                self.names.extend(
                    aliases
                        .iter()
                        .filter(|a| !PROCESS_MODULES.contains(&a.root()))
                        .map(|a| a.bound_name().to_string()),
                );
            }
            StmtKind::ImportFrom { names, .. } => {
                self.names.extend(
                    names
                        .iter()
                        .filter(|a| a.name != "*")
                        .map(|a| a.bound_name().to_string()),
                );
            }
            _ => {}
        }
        ast::walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::NamedExpr { target, .. } => self.target(target),
            ExprKind::Lambda { .. } | ExprKind::Comprehension { .. } => return,
            _ => {}
        }
        ast::walk_expr(self, expr);
    }
}

struct Scan<'a> {
    allowed: &'a HashSet<String>,
    /// Name to process module for the scope being walked: the module names
    /// themselves unless rebound locally, plus `import x as y` aliases.
    process_aliases: HashMap<String, String>,
    findings: Vec<Violation>,
    /// Links of an attribute chain share a position, so the message is part
    /// of the key.
    seen: HashSet<(usize, usize, ViolationKind, String)>,
}

impl<'a> Scan<'a> {
    fn new(allowed: &'a HashSet<String>) -> Self {
        let process_aliases = PROCESS_MODULES
            .iter()
            .map(|m| ((*m).to_string(), (*m).to_string()))
            .collect();
        Self {
            allowed,
            process_aliases,
            findings: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn report(
        &mut self,
        kind: ViolationKind,
        severity: RiskLevel,
        message: String,
        line: usize,
        column: usize,
    ) {
        if self.seen.insert((line, column, kind, message.clone())) {
            self.findings
                .push(Violation::new(kind, severity, message, line, column));
        }
    }

    /// Walks `body` as its own scope. Names bound in it no longer refer to a
    /// process module there, and the enclosing bindings come back afterwards.
    fn walk_scope(&mut self, body: &[Stmt], params: &[Param]) {
        let enclosing = self.process_aliases.clone();
        for name in Bindings::of(body, params) {
            self.process_aliases.remove(&name);
        }
        for stmt in body {
            self.visit_stmt(stmt);
        }
        self.process_aliases = enclosing;
    }

    /// Walks an expression with `names` shadowed.
    fn walk_shadowed(&mut self, expr: &Expr, names: &HashSet<String>) {
        let enclosing = self.process_aliases.clone();
        for name in names {
            self.process_aliases.remove(name);
        }
        ast::walk_expr(self, expr);
        self.process_aliases = enclosing;
    }

    fn finish(mut self) -> Vec<Violation> {
        self.findings.sort_by_key(|v| (v.line, v.column));
        self.findings
    }

    fn import(&mut self, module: &str, stmt: &Stmt) {
        let root = module.split('.').next().unwrap_or(module);
        if let Some((kind, severity)) = classify_module(root, self.allowed) {
            self.report(
                kind,
                severity,
                format!("import of {} module '{module}'", severity_label(severity)),
                stmt.line,
                stmt.column,
            );
        }
    }

    fn name(&mut self, name: &str, expr: &Expr) {
        let finding = if EVAL_PRIMITIVES.contains(&name) {
            Some((
                ViolationKind::DynamicEval,
                RiskLevel::Critical,
                format!("use of dynamic evaluation primitive '{name}'"),
            ))
        } else if ESCAPE_ATTRIBUTES.contains(&name) {
            Some((
                ViolationKind::Reflection,
                RiskLevel::Critical,
                format!("reference to interpreter internals '{name}'"),
            ))
        } else if ATTRIBUTE_FUNCTIONS.contains(&name) || OBJECT_INTERNALS.contains(&name) {
            Some((
                ViolationKind::Reflection,
                RiskLevel::High,
                format!("dynamic attribute access via '{name}'"),
            ))
        } else if INTROSPECTION_FUNCTIONS.contains(&name) {
            Some((
                ViolationKind::Reflection,
                RiskLevel::Medium,
                format!("introspection via '{name}'"),
            ))
        } else if TYPE_CHECKS.contains(&name) {
            Some((
                ViolationKind::Reflection,
                RiskLevel::Low,
                format!("type inspection via '{name}'"),
            ))
        } else {
            None
        };
        if let Some((kind, severity, message)) = finding {
            self.report(kind, severity, message, expr.line, expr.column);
        }
    }

    fn attribute(&mut self, value: &Expr, attr: &str, expr: &Expr) {
        if let Some(base) = value.as_name()
            && let Some(module) = self.process_aliases.get(base).cloned()
        {
            self.report(
                ViolationKind::OsPrimitive,
                RiskLevel::Critical,
                format!("use of operating-system primitive '{module}.{attr}'"),
                expr.line,
                expr.column,
            );
        }

        let finding = if ESCAPE_ATTRIBUTES.contains(&attr) {
            Some((RiskLevel::Critical, "interpreter escape attribute"))
        } else if OBJECT_INTERNALS.contains(&attr) {
            Some((RiskLevel::High, "object internals attribute"))
        } else if is_dunder(attr) {
            Some((RiskLevel::Medium, "special attribute"))
        } else {
            None
        };
        if let Some((severity, label)) = finding {
            self.report(
                ViolationKind::Reflection,
                severity,
                format!("access to {label} '{attr}'"),
                expr.line,
                expr.column,
            );
        }
    }

    fn call(&mut self, func: &Expr, expr: &Expr) {
        let ExprKind::Attribute { value, attr } = &func.kind else {
            return;
        };
        let on_process_module = value
            .as_name()
            .is_some_and(|base| self.process_aliases.contains_key(base));
        if !on_process_module && is_destructive(attr) {
            self.report(
                ViolationKind::DangerousCall,
                RiskLevel::High,
                format!("call to destructive method '{attr}'"),
                expr.line,
                expr.column,
            );
        }
    }
}

const fn severity_label(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Critical => "process or interpreter",
        RiskLevel::High => "network or filesystem",
        RiskLevel::Medium => "reflection",
        RiskLevel::Low | RiskLevel::Safe => "non-whitelisted",
    }
}

impl Visitor for Scan<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.import(&alias.name, stmt);
                    if PROCESS_MODULES.contains(&alias.root()) {
                        self.process_aliases
                            .insert(alias.bound_name().to_string(), alias.root().to_string());
                    }
                }
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => {
                if *level > 0 {
                    self.report(
                        ViolationKind::RestrictedImport,
                        RiskLevel::Low,
                        "relative import".to_string(),
                        stmt.line,
                        stmt.column,
                    );
                } else {
                    self.import(module, stmt);
                }
                for alias in names {
                    let probe = Expr::new(ExprKind::Name(alias.name.clone()), stmt.line, stmt.column);
                    self.name(&alias.name, &probe);
                }
            }
            // Headers evaluate in the enclosing scope, bodies in their own.
            StmtKind::FunctionDef(func) => {
                for expr in func.decorators.iter().chain(&func.returns) {
                    self.visit_expr(expr);
                }
                for param in &func.params {
                    for expr in param.annotation.iter().chain(&param.default) {
                        self.visit_expr(expr);
                    }
                }
                self.walk_scope(&func.body, &func.params);
                return;
            }
            StmtKind::ClassDef(class) => {
                for expr in class.decorators.iter().chain(&class.bases) {
                    self.visit_expr(expr);
                }
                for (_, expr) in &class.keywords {
                    self.visit_expr(expr);
                }
                // Methods resolve names in the enclosing scope, not the class body.
                let enclosing = self.process_aliases.clone();
                let class_names = Bindings::of(&class.body, &[]);
                for stmt in &class.body {
                    if !matches!(stmt.kind, StmtKind::FunctionDef(_)) {
                        for name in &class_names {
                            self.process_aliases.remove(name);
                        }
                    }
                    self.visit_stmt(stmt);
                    self.process_aliases.clone_from(&enclosing);
                }
                return;
            }
            StmtKind::Global(names) | StmtKind::Nonlocal(names) => {
                let keyword = if matches!(stmt.kind, StmtKind::Global(_)) {
                    "global"
                } else {
                    "nonlocal"
                };
                self.report(
                    ViolationKind::UnsupportedScope,
                    RiskLevel::Low,
                    format!("'{keyword}' declaration of {}", names.join(", ")),
                    stmt.line,
                    stmt.column,
                );
            }
            _ => {}
        }
        ast::walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => self.name(name, expr),
            ExprKind::Attribute { value, attr } => self.attribute(value, attr, expr),
            ExprKind::Call { func, .. } => self.call(func, expr),
            ExprKind::Str(text) if ESCAPE_ATTRIBUTES.contains(&text.as_str()) || text == "__import__" => {
                self.report(
                    ViolationKind::Reflection,
                    RiskLevel::Critical,
                    format!("string naming interpreter internals '{text}'"),
                    expr.line,
                    expr.column,
                );
            }
            ExprKind::Lambda { params, .. } => {
                let names: HashSet<String> = params.iter().map(|p| p.name.clone()).collect();
                self.walk_shadowed(expr, &names);
                return;
            }
            ExprKind::Comprehension { generators, .. } => {
                let mut bindings = Bindings::default();
                for generator in generators {
                    bindings.target(&generator.target);
                }
                self.walk_shadowed(expr, &bindings.names);
                return;
            }
            _ => {}
        }
        ast::walk_expr(self, expr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(source: &str) -> RiskLevel {
        analyze(source, false).risk_level()
    }

    fn kinds(source: &str) -> Vec<ViolationKind> {
        analyze(source, false)
            .violations()
            .iter()
            .map(|v| v.kind)
            .collect()
    }

    #[test]
    fn test_clean_strategy_is_safe() {
        let source = "\
import math

class MeanReversion(BaseStrategy):
    window = 20

    def generate_signals(self, data):
        out = {}
        for i in range(self.window, len(data)):
            avg = 0.0
            for j in range(i - self.window, i):
                avg += data[j]
            avg = avg / self.window
            out[i] = 1.0 if data[i] < avg else -1.0
        return out
";
        let report = analyze(source, true);
        assert_eq!(report.risk_level(), RiskLevel::Safe, "{:?}", report.violations());
        assert!(report.passed());
    }

    #[test]
    fn test_import_severities() {
        assert_eq!(risk("import subprocess\n"), RiskLevel::Critical);
        assert_eq!(risk("import os.path\n"), RiskLevel::Critical);
        assert_eq!(risk("from socket import socket\n"), RiskLevel::High);
        assert_eq!(risk("import pathlib\n"), RiskLevel::High);
        assert_eq!(risk("import inspect\n"), RiskLevel::Medium);
        assert_eq!(risk("import json\n"), RiskLevel::Low);
        assert_eq!(risk("from typing import Dict\n"), RiskLevel::Safe);
        assert_eq!(risk("from . import helpers\n"), RiskLevel::Low);
    }

    #[test]
    fn test_custom_whitelist() {
        let sanitizer = CodeSanitizer::with_allowed_modules(["math", "statistics"]);
        let report = sanitizer.analyze("import statistics\n", true);
        assert_eq!(report.risk_level(), RiskLevel::Safe);
        let report = sanitizer.analyze("import typing\n", true);
        assert_eq!(report.risk_level(), RiskLevel::Low);
    }

    #[test]
    fn test_os_call_without_import_is_critical() {
        let report = analyze("def f():\n    os.system('ls')\n", false);
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        assert_eq!(report.violations()[0].kind, ViolationKind::OsPrimitive);
        assert_eq!(report.violations()[0].line, 2);
    }

    #[test]
    fn test_local_named_like_process_module_is_not_flagged() {
        let source = "\
class S:
    def generate_signals(self, data):
        signal = {}
        signal[0] = 1.0
        x = signal.get(0, 0.0)
        return signal
";
        let report = analyze(source, true);
        assert_eq!(report.risk_level(), RiskLevel::Safe, "{:?}", report.violations());

        let source = "\
class S:
    def generate_signals(self, data, io=None):
        for sys in [{}]:
            sys.get(0)
        scores = [os.get(1) for os in [{}]]
        pick = lambda signal: signal.get(2)
        return {}
";
        let report = analyze(source, true);
        assert_eq!(report.risk_level(), RiskLevel::Safe, "{:?}", report.violations());
    }

    #[test]
    fn test_shadowing_ends_with_its_scope() {
        let source = "\
def helper():
    os = {}
    return os.get(0)

def attack():
    os.system('ls')
";
        let report = analyze(source, false);
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        let flagged: Vec<usize> = report
            .violations()
            .iter()
            .filter(|v| v.kind == ViolationKind::OsPrimitive)
            .map(|v| v.line)
            .collect();
        assert_eq!(flagged, [6]);

        let source = "\
class S:
    signal = {}

    def generate_signals(self, data):
        signal.pause()
        return {}
";
        let report = analyze(source, false);
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        assert!(report.violations().iter().any(|v| v.line == 5 && v.kind == ViolationKind::OsPrimitive));

        let source = "import json as os\nos.loads('{}')\n";
        assert!(!kinds(source).contains(&ViolationKind::OsPrimitive));
        assert_eq!(risk(source), RiskLevel::Low);

        let source = "signal = 1\ndef f():\n    import signal\n    signal.pause()\n";
        assert_eq!(risk(source), RiskLevel::Critical);
    }

    #[test]
    fn test_aliased_process_module() {
        let report = analyze("import subprocess as sp\nsp.run(['id'])\n", false);
        assert_eq!(report.violations().len(), 2);
        assert_eq!(report.violations()[1].kind, ViolationKind::OsPrimitive);
        assert!(report.violations()[1].message.contains("subprocess.run"));
    }

    #[test]
    fn test_dynamic_evaluation() {
        for source in [
            "eval('1')\n",
            "exec('x=1')\n",
            "f = open\n",
            "__import__('os')\n",
            "compile('1', 'x', 'eval')\n",
        ] {
            assert_eq!(risk(source), RiskLevel::Critical, "{source}");
            assert!(kinds(source).contains(&ViolationKind::DynamicEval), "{source}");
        }
    }

    #[test]
    fn test_reflection_ladder() {
        assert_eq!(risk("().__class__.__bases__[0].__subclasses__()\n"), RiskLevel::Critical);
        assert_eq!(risk("x = obj.__dict__\n"), RiskLevel::High);
        assert_eq!(risk("getattr(obj, 'name')\n"), RiskLevel::High);
        assert_eq!(risk("t = type(x)\n"), RiskLevel::Medium);
        assert_eq!(risk("n = x.__len__()\n"), RiskLevel::Medium);
        assert_eq!(risk("ok = isinstance(x, float)\n"), RiskLevel::Low);
        assert_eq!(risk("g = frame.f_globals\n"), RiskLevel::Critical);
    }

    #[test]
    fn test_escape_attribute_spelled_as_string() {
        assert_eq!(risk("getattr(f, '__globals__')\n"), RiskLevel::Critical);
    }

    #[test]
    fn test_scope_statements_are_low() {
        let report = analyze("def f():\n    global counter\n    counter = 1\n", true);
        assert_eq!(report.risk_level(), RiskLevel::Low);
        assert_eq!(report.violations()[0].kind, ViolationKind::UnsupportedScope);
        assert!(!report.passed());
    }

    #[test]
    fn test_destructive_methods() {
        assert_eq!(risk("shutil_like.rmtree('/tmp')\n"), RiskLevel::High);
        assert_eq!(risk("x.spawnv(1)\n"), RiskLevel::High);
        assert_eq!(risk("x.execvp('sh')\n"), RiskLevel::High);
        assert_eq!(risk("x.execute_order()\n"), RiskLevel::Safe);
    }

    #[test]
    fn test_fstring_interpolation_is_inspected() {
        assert_eq!(risk("msg = f'{eval(code)}'\n"), RiskLevel::Critical);
    }

    #[test]
    fn test_parse_error_is_critical() {
        let report = analyze("def broken(:\n", true);
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        assert_eq!(report.violations()[0].kind, ViolationKind::SyntaxError);
        let analysis = CodeSanitizer::new().inspect("def broken(:\n", true);
        assert!(analysis.module.is_none());
    }

    #[test]
    fn test_lenient_medium_fails_passed_but_is_admitted() {
        let report = analyze("import inspect\n", false);
        assert_eq!(report.risk_level(), RiskLevel::Medium);
        assert!(!report.passed());
        assert!(report.admits());
        let strict = analyze("import inspect\n", true);
        assert!(!strict.admits());
    }

    #[test]
    fn test_findings_sorted_by_position() {
        let report = analyze("x = type(a)\nimport os\n", false);
        let lines: Vec<usize> = report.violations().iter().map(|v| v.line).collect();
        assert_eq!(lines, vec![1, 2]);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let source = "import os\nimport inspect\nx = eval('1')\n";
        assert_eq!(analyze(source, false), analyze(source, false));
    }

    #[test]
    fn test_attribute_chain_scores_every_link() {
        let report = analyze("x = f.__globals__.__doc__\n", false);
        assert_eq!(report.risk_level(), RiskLevel::Critical);
        assert!(!report.admits());
        assert_eq!(report.violations().len(), 2, "{:?}", report.violations());

        let report = analyze("x = obj.__class__.__name__\n", false);
        assert_eq!(report.risk_level(), RiskLevel::High);
        assert!(!report.admits());
    }

    #[test]
    fn test_never_panics_on_garbage() {
        for source in ["\u{0}", "((((", "'''", "class\n", "def f(,):\n    pass\n"] {
            let report = analyze(source, false);
            assert_eq!(report.risk_level(), RiskLevel::Critical, "{source:?}");
        }
    }
}
