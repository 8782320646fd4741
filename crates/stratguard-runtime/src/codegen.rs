//! Compiles a parsed strategy script to a WebAssembly module.
//!
//! The compiled subset is numeric. Every value is an `f64`. Signal maps and
//! market data are host objects referred to by numeric handles (see
//! [`crate::host`]). Class attributes become mutable globals, so each
//! instantiation starts from the class defaults.
//!
//! Every builtin call, `math` member and data attribute is checked against
//! the [`ExecutionNamespace`] while compiling. A denial aborts with
//! [`Error::SecurityViolation`]; any construct outside the subset aborts
//! with [`Error::CompilationError`] carrying the source line.
//!
//! Each contract operation the class defines is exported under its method
//! name with type `(f64) -> f64`: the argument is the market data handle
//! and the result is a signal map handle.

use crate::host::{MATH_MODULE, RT_MODULE, fail_code};
use crate::permissions::{
    BUILTIN_CATALOGUE, Decision, ExecutionNamespace, HOST_MATH_MEMBERS, Operation,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use stratguard_core::{ContentHash, Error, Field, Result, StrategyContract, StrategyOp};
use stratguard_script::ast::{
    Alias, Arg, BinOp, BoolOp, ClassDef, CmpOp, Expr, ExprKind, FunctionDef, Module, ParamKind, Stmt,
    StmtKind, UnaryOp,
};

/// Output of [`compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStrategy {
    /// Compiled class
    pub class_name: String,
    /// Contract operations the module exports
    pub operations: Vec<StrategyOp>,
    /// Generated text format, kept for diagnostics
    pub wat: String,
    /// Assembled module bytes
    pub wasm: Vec<u8>,
    /// Digest of `wasm`
    pub wasm_hash: ContentHash,
}

/// Compiles `class_name` from `module`.
///
/// # Errors
///
/// - [`Error::SecurityViolation`] if the code uses a symbol the namespace
///   denies
/// - [`Error::CompilationError`] if the class is missing, violates
///   `contract`, or uses constructs outside the compiled subset
///
/// # Examples
///
/// ```
/// use stratguard_core::{StrategyContract, StrategyOp};
/// use stratguard_runtime::codegen::compile;
/// use stratguard_runtime::permissions::{PermissionPolicy, build_namespace};
///
/// let source = "
/// class Flat:
///     def generate_signals(self, data):
///         return {0: 0.0}
/// ";
/// let module = stratguard_script::parse(source).unwrap();
/// let namespace = build_namespace(&PermissionPolicy::default());
/// let compiled = compile(&module, "Flat", &namespace, &StrategyContract::standard()).unwrap();
///
/// assert_eq!(compiled.operations, vec![StrategyOp::GenerateSignals]);
/// assert!(compiled.wat.contains("(export \"generate_signals\")"));
/// ```
pub fn compile(
    module: &Module,
    class_name: &str,
    namespace: &ExecutionNamespace,
    contract: &StrategyContract,
) -> Result<CompiledStrategy> {
    let program = Program::collect(module, class_name, namespace)?;
    let (wat, operations) = program.emit(contract)?;
    let wasm = wat::parse_str(&wat).map_err(|e| Error::CompilationError {
        message: format!("generated module failed to assemble: {e}"),
        line: None,
    })?;
    let wasm_hash = ContentHash::of_bytes(&wasm);
    tracing::debug!(
        class = class_name,
        operations = operations.len(),
        bytes = wasm.len(),
        "strategy compiled"
    );
    Ok(CompiledStrategy {
        class_name: class_name.to_string(),
        operations,
        wat,
        wasm,
        wasm_hash,
    })
}

const RT_IMPORTS: &[(&str, &str)] = &[
    ("new_map", "(result f64)"),
    ("get_item", "(param f64 f64) (result f64)"),
    ("set_item", "(param f64 f64 f64)"),
    ("get_or", "(param f64 f64 f64) (result f64)"),
    ("contains", "(param f64 f64) (result f64)"),
    ("length", "(param f64) (result f64)"),
    ("field", "(param f64 f64 f64) (result f64)"),
    ("fail", "(param f64)"),
    ("pow", "(param f64 f64) (result f64)"),
];

const PRELUDE: &str = "
  (func $__check_divisor (param $b f64)
    local.get $b
    f64.const 0
    f64.eq
    if
      f64.const ZERO_DIVISION
      call $rt_fail
    end)
  (func $__div (param $a f64) (param $b f64) (result f64)
    local.get $b
    call $__check_divisor
    local.get $a
    local.get $b
    f64.div)
  (func $__floordiv (param $a f64) (param $b f64) (result f64)
    local.get $b
    call $__check_divisor
    local.get $a
    local.get $b
    f64.div
    f64.floor)
  (func $__mod (param $a f64) (param $b f64) (result f64)
    local.get $b
    call $__check_divisor
    local.get $a
    local.get $b
    local.get $a
    local.get $b
    f64.div
    f64.floor
    f64.mul
    f64.sub)
";

fn error(line: usize, message: impl Into<String>) -> Error {
    Error::CompilationError {
        message: message.into(),
        line: Some(line),
    }
}

fn f64_lit(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        format!("{value:?}")
    }
}

/// Maps a script identifier onto WAT identifier characters.
fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push_str(&format!("~{:x}", u32::from(c)));
        }
    }
    out
}

fn math_constant(member: &str) -> Option<f64> {
    match member {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "inf" => Some(f64::INFINITY),
        _ => None,
    }
}

#[derive(Debug)]
struct Callable<'a> {
    symbol: String,
    line: usize,
    self_name: Option<String>,
    params: Vec<String>,
    defaults: Vec<Option<f64>>,
    def: &'a FunctionDef,
}

#[derive(Debug)]
struct Program<'a> {
    namespace: &'a ExecutionNamespace,
    class_name: String,
    constants: HashMap<String, f64>,
    math_aliases: BTreeSet<String>,
    math_imports: HashMap<String, String>,
    denied_imports: HashMap<String, Error>,
    functions: BTreeMap<String, Callable<'a>>,
    methods: BTreeMap<String, Callable<'a>>,
    attributes: BTreeMap<String, f64>,
}

impl<'a> Program<'a> {
    fn collect(
        module: &'a Module,
        class_name: &str,
        namespace: &'a ExecutionNamespace,
    ) -> Result<Self> {
        let mut program = Self {
            namespace,
            class_name: class_name.to_string(),
            constants: HashMap::new(),
            math_aliases: BTreeSet::new(),
            math_imports: HashMap::new(),
            denied_imports: HashMap::new(),
            functions: BTreeMap::new(),
            methods: BTreeMap::new(),
            attributes: BTreeMap::new(),
        };

        let mut class = None;
        for stmt in &module.body {
            let line = stmt.line;
            match &stmt.kind {
                StmtKind::Import(aliases) => {
                    for alias in aliases {
                        program.import(&alias.name, alias.bound_name());
                    }
                }
                StmtKind::ImportFrom {
                    module: name,
                    names,
                    level,
                } => program.import_from(name, names, *level, line)?,
                StmtKind::ClassDef(def) if def.name == class_name => class = Some(def),
                StmtKind::ClassDef(_) | StmtKind::Pass => {}
                StmtKind::FunctionDef(def) => {
                    let callable = program.callable(def, "f", false, line)?;
                    program.functions.insert(def.name.clone(), callable);
                }
                StmtKind::Assign { targets, value } => {
                    for target in targets {
                        program.constant_binding(target, Some(value), line)?;
                    }
                }
                StmtKind::AnnAssign { target, value, .. } => {
                    program.constant_binding(target, value.as_ref(), line)?;
                }
                StmtKind::Expr(expr) if matches!(expr.kind, ExprKind::Str(_)) => {}
                _ => return Err(error(line, "unsupported statement at module level")),
            }
        }

        let class = class.ok_or_else(|| Error::CompilationError {
            message: format!("class '{class_name}' not found in source"),
            line: None,
        })?;
        program.collect_class(class)?;
        Ok(program)
    }

    fn permit(&self, operation: &Operation) -> Result<()> {
        self.namespace.check(operation).into_result()
    }

    /// Binds `import module [as bound]`. A denied module binds a deny proxy:
    /// the load fails only where the name is used.
    fn import(&mut self, module: &str, bound: &str) {
        match self.permit(&Operation::Import(module.to_string())) {
            Ok(()) if module == "math" => {
                self.math_aliases.insert(bound.to_string());
            }
            Ok(()) => {}
            Err(err) => {
                self.denied_imports.insert(bound.to_string(), err);
            }
        }
    }

    fn import_from(
        &mut self,
        module: &str,
        names: &[Alias],
        level: usize,
        line: usize,
    ) -> Result<()> {
        if level > 0 {
            return Err(error(line, "relative imports are not supported"));
        }
        if let Err(err) = self.permit(&Operation::Import(module.to_string())) {
            for alias in names {
                if alias.name == "*" {
                    return Err(err);
                }
                self.denied_imports
                    .insert(alias.bound_name().to_string(), err.clone());
            }
            return Ok(());
        }
        if module != "math" {
            return Ok(());
        }
        for alias in names {
            if alias.name == "*" {
                return Err(error(line, "wildcard imports are not supported"));
            }
            self.permit(&Operation::ModuleMember {
                module: module.to_string(),
                member: alias.name.clone(),
            })?;
            self.math_imports
                .insert(alias.bound_name().to_string(), alias.name.clone());
        }
        Ok(())
    }

    fn constant_binding(&mut self, target: &Expr, value: Option<&Expr>, line: usize) -> Result<()> {
        let Some(name) = target.as_name() else {
            return Err(error(line, "module-level assignments must bind a name"));
        };
        let Some(value) = value else {
            return Ok(());
        };
        let folded = self.fold(value).ok_or_else(|| {
            error(
                line,
                format!("module-level value '{name}' must be a numeric constant"),
            )
        })?;
        self.constants.insert(name.to_string(), folded);
        Ok(())
    }

    fn collect_class(&mut self, class: &'a ClassDef) -> Result<()> {
        if !class.decorators.is_empty() {
            return Err(error(
                class.decorators[0].line,
                "class decorators are not supported",
            ));
        }
        for stmt in &class.body {
            let line = stmt.line;
            match &stmt.kind {
                StmtKind::FunctionDef(def) => {
                    let callable = self.callable(def, "m", true, line)?;
                    self.methods.insert(def.name.clone(), callable);
                }
                StmtKind::Assign { targets, value } => {
                    for target in targets {
                        self.class_attribute(target, Some(value), line)?;
                    }
                }
                StmtKind::AnnAssign { target, value, .. } => {
                    self.class_attribute(target, value.as_ref(), line)?;
                }
                StmtKind::Pass => {}
                StmtKind::Expr(expr) if matches!(expr.kind, ExprKind::Str(_)) => {}
                _ => return Err(error(line, "unsupported statement in class body")),
            }
        }

        let mut assigned = BTreeSet::new();
        for method in self.methods.values() {
            if let Some(self_name) = &method.self_name {
                collect_self_attributes(&method.def.body, self_name, &mut assigned);
            }
        }
        for name in assigned {
            self.attributes.entry(name).or_insert(0.0);
        }
        Ok(())
    }

    fn class_attribute(&mut self, target: &Expr, value: Option<&Expr>, line: usize) -> Result<()> {
        let Some(name) = target.as_name() else {
            return Err(error(line, "class attributes must be plain names"));
        };
        let initial = match value {
            Some(value) => self.fold(value).ok_or_else(|| {
                error(
                    line,
                    format!("class attribute '{name}' must be a numeric constant"),
                )
            })?,
            None => 0.0,
        };
        self.attributes.insert(name.to_string(), initial);
        Ok(())
    }

    fn callable(
        &self,
        def: &'a FunctionDef,
        prefix: &str,
        is_method: bool,
        line: usize,
    ) -> Result<Callable<'a>> {
        if let Some(decorator) = def.decorators.first() {
            return Err(error(decorator.line, "decorators are not supported"));
        }
        let mut params = def.params.iter();
        let self_name = if is_method {
            match params.next() {
                Some(first) if first.kind == ParamKind::Positional => Some(first.name.clone()),
                _ => {
                    return Err(error(
                        line,
                        format!("method '{}' must take self as its first parameter", def.name),
                    ));
                }
            }
        } else {
            None
        };

        let mut names = Vec::new();
        let mut defaults = Vec::new();
        for param in params {
            if matches!(param.kind, ParamKind::VarArgs | ParamKind::KwArgs) {
                continue;
            }
            let default = match &param.default {
                Some(value) => Some(self.fold(value).ok_or_else(|| {
                    error(
                        value.line,
                        format!(
                            "default of parameter '{}' must be a numeric constant",
                            param.name
                        ),
                    )
                })?),
                None => None,
            };
            names.push(param.name.clone());
            defaults.push(default);
        }

        Ok(Callable {
            symbol: format!("${prefix}_{}", mangle(&def.name)),
            line,
            self_name,
            params: names,
            defaults,
            def,
        })
    }

    fn fold(&self, expr: &Expr) -> Option<f64> {
        match &expr.kind {
            ExprKind::Number(n) => Some(*n),
            ExprKind::Bool(b) => Some(f64::from(u8::from(*b))),
            ExprKind::NoneLit => Some(0.0),
            ExprKind::Name(name) => self.constants.get(name).copied().or_else(|| {
                let member = self.math_imports.get(name)?;
                self.namespace
                    .allows_math(member)
                    .then(|| math_constant(member))
                    .flatten()
            }),
            ExprKind::Attribute { value, attr } => {
                let alias = value.as_name()?;
                (self.math_aliases.contains(alias) && self.namespace.allows_math(attr))
                    .then(|| math_constant(attr))
                    .flatten()
            }
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => self.fold(operand).map(|v| -v),
            ExprKind::Unary {
                op: UnaryOp::Pos,
                operand,
            } => self.fold(operand),
            ExprKind::Binary { left, op, right } => {
                let (a, b) = (self.fold(left)?, self.fold(right)?);
                match op {
                    BinOp::Add => Some(a + b),
                    BinOp::Sub => Some(a - b),
                    BinOp::Mul => Some(a * b),
                    BinOp::Div if b != 0.0 => Some(a / b),
                    BinOp::FloorDiv if b != 0.0 => Some((a / b).floor()),
                    BinOp::Mod if b != 0.0 => Some(b.mul_add(-(a / b).floor(), a)),
                    BinOp::Pow => Some(a.powf(b)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn emit(&self, contract: &StrategyContract) -> Result<(String, Vec<StrategyOp>)> {
        let mut functions = Vec::new();
        let mut host_math = BTreeSet::new();
        for callable in self.functions.values().chain(self.methods.values()) {
            let (code, used) = FnEmitter::compile(self, callable)?;
            functions.push(code);
            host_math.extend(used);
        }

        let operations: Vec<StrategyOp> = StrategyOp::ALL
            .into_iter()
            .filter(|op| self.methods.contains_key(op.method_name()))
            .collect();
        contract.check(&self.class_name, &operations)?;

        let mut exports = Vec::new();
        for op in &operations {
            exports.push(self.export(*op)?);
        }

        Ok((self.assemble(&functions, &exports, &host_math), operations))
    }

    fn export(&self, op: StrategyOp) -> Result<String> {
        let name = op.method_name();
        let Some(method) = self.methods.get(name) else {
            return Err(Error::CompilationError {
                message: format!("class '{}' has no method '{name}'", self.class_name),
                line: None,
            });
        };
        let line = method.line;
        let mut code = format!("  (func (export \"{name}\") (param $data f64) (result f64)\n");
        if method.params.is_empty() {
            // `def op(self, *args)` takes the data argument and ignores it.
            let variadic = method
                .def
                .params
                .iter()
                .any(|param| param.kind == ParamKind::VarArgs);
            if !variadic {
                return Err(error(
                    line,
                    format!("'{name}' must accept the market data argument"),
                ));
            }
            code.push_str(&format!("    call {})\n", method.symbol));
            return Ok(code);
        }
        code.push_str("    local.get $data\n");
        for (param, default) in method.params.iter().zip(&method.defaults).skip(1) {
            let value = default.ok_or_else(|| {
                error(
                    line,
                    format!("parameter '{param}' of '{name}' needs a default value"),
                )
            })?;
            code.push_str(&format!("    f64.const {}\n", f64_lit(value)));
        }
        code.push_str(&format!("    call {})\n", method.symbol));
        Ok(code)
    }

    fn assemble(
        &self,
        functions: &[String],
        exports: &[String],
        host_math: &BTreeSet<&'static str>,
    ) -> String {
        let mut wat = String::from("(module\n");
        for (name, signature) in RT_IMPORTS {
            wat.push_str(&format!(
                "  (import \"{RT_MODULE}\" \"{name}\" (func $rt_{name} {signature}))\n"
            ));
        }
        for member in host_math {
            let params = if *member == "pow" { "f64 f64" } else { "f64" };
            wat.push_str(&format!(
                "  (import \"{MATH_MODULE}\" \"{member}\" (func $math_{member} (param {params}) (result f64)))\n"
            ));
        }
        for (name, initial) in &self.attributes {
            wat.push_str(&format!(
                "  (global $a_{} (mut f64) (f64.const {}))\n",
                mangle(name),
                f64_lit(*initial)
            ));
        }
        wat.push_str(&PRELUDE.replace("ZERO_DIVISION", &f64_lit(fail_code::ZERO_DIVISION)));
        for function in functions.iter().chain(exports) {
            wat.push_str(function);
        }
        wat.push_str(")\n");
        wat
    }
}

fn collect_locals(body: &[Stmt], out: &mut BTreeSet<String>) {
    let bind = |target: &Expr, out: &mut BTreeSet<String>| {
        if let Some(name) = target.as_name() {
            out.insert(name.to_string());
        }
    };
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    bind(target, out);
                }
            }
            StmtKind::AnnAssign { target, .. } | StmtKind::AugAssign { target, .. } => {
                bind(target, out);
            }
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                bind(target, out);
                collect_locals(body, out);
                collect_locals(orelse, out);
            }
            StmtKind::If { body, orelse, .. } | StmtKind::While { body, orelse, .. } => {
                collect_locals(body, out);
                collect_locals(orelse, out);
            }
            _ => {}
        }
    }
}

fn self_attribute<'e>(expr: &'e Expr, self_name: &str) -> Option<&'e str> {
    match &expr.kind {
        ExprKind::Attribute { value, attr } if value.as_name() == Some(self_name) => Some(attr),
        _ => None,
    }
}

fn collect_self_attributes(body: &[Stmt], self_name: &str, out: &mut BTreeSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                out.extend(
                    targets
                        .iter()
                        .filter_map(|t| self_attribute(t, self_name))
                        .map(str::to_string),
                );
            }
            StmtKind::AnnAssign { target, .. } | StmtKind::AugAssign { target, .. } => {
                if let Some(attr) = self_attribute(target, self_name) {
                    out.insert(attr.to_string());
                }
            }
            StmtKind::If { body, orelse, .. }
            | StmtKind::While { body, orelse, .. }
            | StmtKind::For { body, orelse, .. } => {
                collect_self_attributes(body, self_name, out);
                collect_self_attributes(orelse, self_name, out);
            }
            _ => {}
        }
    }
}

struct FnEmitter<'p, 'a> {
    program: &'p Program<'a>,
    self_name: Option<&'p str>,
    locals: BTreeSet<String>,
    temps: usize,
    labels: usize,
    loops: Vec<(String, String)>,
    code: String,
    host_math: BTreeSet<&'static str>,
}

impl<'p, 'a> FnEmitter<'p, 'a> {
    fn compile(
        program: &'p Program<'a>,
        callable: &'p Callable<'a>,
    ) -> Result<(String, BTreeSet<&'static str>)> {
        let mut body_locals = BTreeSet::new();
        collect_locals(&callable.def.body, &mut body_locals);
        for param in &callable.params {
            body_locals.remove(param);
        }

        let mut emitter = Self {
            program,
            self_name: callable.self_name.as_deref(),
            locals: callable
                .params
                .iter()
                .chain(&body_locals)
                .cloned()
                .collect(),
            temps: 0,
            labels: 0,
            loops: Vec::new(),
            code: String::new(),
            host_math: BTreeSet::new(),
        };
        emitter.block(&callable.def.body)?;
        emitter.op("f64.const 0");

        let mut out = format!("  (func {}", callable.symbol);
        for param in &callable.params {
            out.push_str(&format!(" (param $l_{} f64)", mangle(param)));
        }
        out.push_str(" (result f64)\n");
        for local in &body_locals {
            out.push_str(&format!("    (local $l_{} f64)\n", mangle(local)));
        }
        for temp in 0..emitter.temps {
            out.push_str(&format!("    (local $t{temp} f64)\n"));
        }
        out.push_str(&emitter.code);
        out.push_str("  )\n");
        Ok((out, emitter.host_math))
    }

    fn op(&mut self, instruction: impl AsRef<str>) {
        self.code.push_str("    ");
        self.code.push_str(instruction.as_ref());
        self.code.push('\n');
    }

    fn constant(&mut self, value: f64) {
        self.op(format!("f64.const {}", f64_lit(value)));
    }

    fn temp(&mut self) -> String {
        let name = format!("$t{}", self.temps);
        self.temps += 1;
        name
    }

    fn label(&mut self) -> usize {
        self.labels += 1;
        self.labels
    }

    fn permit(&self, operation: Operation) -> Result<()> {
        self.program.permit(&operation)
    }

    fn is_self(&self, expr: &Expr) -> bool {
        self.self_name.is_some() && expr.as_name() == self.self_name
    }

    fn check_denied_import(&self, expr: &Expr) -> Result<()> {
        match expr.as_name() {
            Some(name) if !self.locals.contains(name) => self
                .program
                .denied_imports
                .get(name)
                .map_or(Ok(()), |err| Err(err.clone())),
            _ => Ok(()),
        }
    }

    fn is_math_alias(&self, expr: &Expr) -> bool {
        expr.as_name().is_some_and(|name| {
            self.program.math_aliases.contains(name) && !self.locals.contains(name)
        })
    }

    // Statements

    fn block(&mut self, body: &[Stmt]) -> Result<()> {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Pass => Ok(()),
            StmtKind::Expr(expr) => {
                if !matches!(expr.kind, ExprKind::Str(_)) {
                    self.expr(expr)?;
                    self.op("drop");
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(value)?,
                    None => self.constant(0.0),
                }
                self.op("return");
                Ok(())
            }
            StmtKind::Assign { targets, value } => self.assign(targets, value, line),
            StmtKind::AnnAssign { target, value, .. } => match value {
                Some(value) => self.assign(std::slice::from_ref(target), value, line),
                None if target.as_name().is_some() || self.self_attr(target).is_some() => Ok(()),
                None => Err(error(line, "annotation target must be a name")),
            },
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, line),
            StmtKind::If { test, body, orelse } => {
                self.cond(test)?;
                self.op("if");
                self.block(body)?;
                if !orelse.is_empty() {
                    self.op("else");
                    self.block(orelse)?;
                }
                self.op("end");
                Ok(())
            }
            StmtKind::While { test, body, orelse } => {
                if !orelse.is_empty() {
                    return Err(error(line, "'else' on loops is not supported"));
                }
                self.while_loop(test, body)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                if !orelse.is_empty() {
                    return Err(error(line, "'else' on loops is not supported"));
                }
                self.for_range(target, iter, body, line)
            }
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                let target = self
                    .loops
                    .last()
                    .map(|(brk, cont)| if is_break { brk.clone() } else { cont.clone() })
                    .ok_or_else(|| error(line, "'break' or 'continue' outside a loop"))?;
                self.op(format!("br {target}"));
                Ok(())
            }
            StmtKind::Assert { test, .. } => {
                self.cond(test)?;
                self.op("i32.eqz");
                self.op("if");
                self.constant(fail_code::ASSERTION);
                self.op("call $rt_fail");
                self.op("end");
                Ok(())
            }
            StmtKind::Raise(_) => {
                self.constant(fail_code::RAISED);
                self.op("call $rt_fail");
                self.op("unreachable");
                Ok(())
            }
            StmtKind::FunctionDef(_) | StmtKind::ClassDef(_) => {
                Err(error(line, "nested definitions are not supported"))
            }
            StmtKind::Try { .. } => Err(error(line, "try statements are not supported")),
            StmtKind::With { .. } => Err(error(line, "with statements are not supported")),
            StmtKind::Import(_) | StmtKind::ImportFrom { .. } => {
                Err(error(line, "imports are only allowed at module level"))
            }
            StmtKind::Global(_) | StmtKind::Nonlocal(_) => {
                Err(error(line, "global and nonlocal are not supported"))
            }
            StmtKind::Delete(_) => Err(error(line, "del is not supported")),
        }
    }

    fn self_attr<'e>(&self, expr: &'e Expr) -> Option<&'e str> {
        self.self_name.and_then(|name| self_attribute(expr, name))
    }

    fn assign(&mut self, targets: &[Expr], value: &Expr, line: usize) -> Result<()> {
        self.expr(value)?;
        let temp = self.temp();
        self.op(format!("local.set {temp}"));
        for target in targets {
            self.store_from(target, &temp, line)?;
        }
        Ok(())
    }

    fn store_from(&mut self, target: &Expr, temp: &str, line: usize) -> Result<()> {
        if let Some(attr) = self.self_attr(target) {
            self.op(format!("local.get {temp}"));
            self.op(format!("global.set $a_{}", mangle(attr)));
            return Ok(());
        }
        match &target.kind {
            ExprKind::Name(name) => {
                self.op(format!("local.get {temp}"));
                self.op(format!("local.set $l_{}", mangle(name)));
                Ok(())
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.index(index)?;
                self.op(format!("local.get {temp}"));
                self.op("call $rt_set_item");
                Ok(())
            }
            ExprKind::Tuple(_) | ExprKind::List(_) => {
                Err(error(line, "tuple unpacking is not supported"))
            }
            _ => Err(error(line, "cannot assign to this expression")),
        }
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr, line: usize) -> Result<()> {
        if let Some(attr) = self.self_attr(target) {
            let global = format!("$a_{}", mangle(attr));
            self.op(format!("global.get {global}"));
            self.expr(value)?;
            self.binop(op, line)?;
            self.op(format!("global.set {global}"));
            return Ok(());
        }
        match &target.kind {
            ExprKind::Name(name) => {
                let local = format!("$l_{}", mangle(name));
                self.op(format!("local.get {local}"));
                self.expr(value)?;
                self.binop(op, line)?;
                self.op(format!("local.set {local}"));
                Ok(())
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                let (map, key) = (self.temp(), self.temp());
                self.expr(container)?;
                self.op(format!("local.set {map}"));
                self.index(index)?;
                self.op(format!("local.set {key}"));
                for _ in 0..2 {
                    self.op(format!("local.get {map}"));
                    self.op(format!("local.get {key}"));
                }
                self.op("call $rt_get_item");
                self.expr(value)?;
                self.binop(op, line)?;
                self.op("call $rt_set_item");
                Ok(())
            }
            _ => Err(error(line, "cannot assign to this expression")),
        }
    }

    fn binop(&mut self, op: BinOp, line: usize) -> Result<()> {
        let instruction = match op {
            BinOp::Add => "f64.add",
            BinOp::Sub => "f64.sub",
            BinOp::Mul => "f64.mul",
            BinOp::Div => "call $__div",
            BinOp::FloorDiv => "call $__floordiv",
            BinOp::Mod => "call $__mod",
            BinOp::Pow => "call $rt_pow",
            other => {
                return Err(error(
                    line,
                    format!("operator '{}' is not supported", other.symbol()),
                ));
            }
        };
        self.op(instruction);
        Ok(())
    }

    fn loop_body(&mut self, brk: &str, cont: &str, body: &[Stmt]) -> Result<()> {
        self.op(format!("block {cont}"));
        self.loops.push((brk.to_string(), cont.to_string()));
        let result = self.block(body);
        self.loops.pop();
        result?;
        self.op("end");
        Ok(())
    }

    fn while_loop(&mut self, test: &Expr, body: &[Stmt]) -> Result<()> {
        let id = self.label();
        let (brk, top, cont) = (format!("$brk{id}"), format!("$top{id}"), format!("$cont{id}"));
        self.op(format!("block {brk}"));
        self.op(format!("loop {top}"));
        self.cond(test)?;
        self.op("i32.eqz");
        self.op(format!("br_if {brk}"));
        self.loop_body(&brk, &cont, body)?;
        self.op(format!("br {top}"));
        self.op("end");
        self.op("end");
        Ok(())
    }

    fn for_range(&mut self, target: &Expr, iter: &Expr, body: &[Stmt], line: usize) -> Result<()> {
        let Some(var) = target.as_name() else {
            return Err(error(line, "for loop target must be a name"));
        };
        let args = match &iter.kind {
            ExprKind::Call { func, args }
                if func.as_name() == Some("range")
                    && !self.program.functions.contains_key("range") =>
            {
                args
            }
            _ => return Err(error(line, "for loops must iterate over range(...)")),
        };
        self.permit(Operation::CallBuiltin("range".to_string()))?;
        let args = positional(args, line)?;
        let (start, stop, step) = match args.as_slice() {
            [stop] => (None, *stop, 1.0),
            [start, stop] => (Some(*start), *stop, 1.0),
            [start, stop, step] => {
                let step = self
                    .program
                    .fold(step)
                    .filter(|s| *s != 0.0 && s.is_finite())
                    .ok_or_else(|| {
                        error(line, "range() step must be a non-zero numeric constant")
                    })?;
                (Some(*start), *stop, step)
            }
            _ => return Err(error(line, "range() takes 1 to 3 arguments")),
        };

        let (counter, end) = (self.temp(), self.temp());
        match start {
            Some(start) => self.expr(start)?,
            None => self.constant(0.0),
        }
        self.op(format!("local.set {counter}"));
        self.expr(stop)?;
        self.op(format!("local.set {end}"));

        let id = self.label();
        let (brk, top, cont) = (format!("$brk{id}"), format!("$top{id}"), format!("$cont{id}"));
        self.op(format!("block {brk}"));
        self.op(format!("loop {top}"));
        self.op(format!("local.get {counter}"));
        self.op(format!("local.get {end}"));
        self.op(if step > 0.0 { "f64.lt" } else { "f64.gt" });
        self.op("i32.eqz");
        self.op(format!("br_if {brk}"));
        self.op(format!("local.get {counter}"));
        self.op(format!("local.set $l_{}", mangle(var)));
        self.loop_body(&brk, &cont, body)?;
        self.op(format!("local.get {counter}"));
        self.constant(step);
        self.op("f64.add");
        self.op(format!("local.set {counter}"));
        self.op(format!("br {top}"));
        self.op("end");
        self.op("end");
        Ok(())
    }

    // Expressions: `expr` leaves one f64, `cond` leaves one i32.

    fn expr(&mut self, expr: &Expr) -> Result<()> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Number(n) => {
                self.constant(*n);
                Ok(())
            }
            ExprKind::Bool(b) => {
                self.constant(f64::from(u8::from(*b)));
                Ok(())
            }
            ExprKind::NoneLit => {
                self.constant(0.0);
                Ok(())
            }
            ExprKind::Name(name) => self.load_name(name, line),
            ExprKind::Attribute { value, attr } => self.attribute(value, attr, line),
            ExprKind::Subscript { value, index } => self.subscript(value, index),
            ExprKind::Call { func, args } => self.call(func, args, line),
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => {
                    self.expr(operand)?;
                    self.op("f64.neg");
                    Ok(())
                }
                UnaryOp::Pos => self.expr(operand),
                UnaryOp::Not => {
                    self.cond(operand)?;
                    self.op("i32.eqz");
                    self.op("f64.convert_i32_u");
                    Ok(())
                }
                UnaryOp::Invert => Err(error(line, "operator '~' is not supported")),
            },
            ExprKind::Binary { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.binop(*op, line)
            }
            ExprKind::Compare { .. } => {
                self.cond(expr)?;
                self.op("f64.convert_i32_u");
                Ok(())
            }
            ExprKind::BoolOp { op, values } => self.bool_value(*op, values, line),
            ExprKind::IfExp { test, body, orelse } => {
                self.cond(test)?;
                self.op("if (result f64)");
                self.expr(body)?;
                self.op("else");
                self.expr(orelse)?;
                self.op("end");
                Ok(())
            }
            ExprKind::Dict(entries) => self.dict(entries, line),
            ExprKind::Str(_) | ExprKind::FString(_) => {
                Err(error(line, "string values are not supported"))
            }
            ExprKind::List(_)
            | ExprKind::Tuple(_)
            | ExprKind::Set(_)
            | ExprKind::Comprehension { .. } => Err(error(
                line,
                "only numbers and signal maps are supported as values",
            )),
            ExprKind::Lambda { .. } => Err(error(line, "lambda is not supported")),
            _ => Err(error(line, "unsupported expression")),
        }
    }

    fn load_name(&mut self, name: &str, line: usize) -> Result<()> {
        if self.locals.contains(name) {
            self.op(format!("local.get $l_{}", mangle(name)));
            return Ok(());
        }
        let program = self.program;
        if let Some(value) = program.constants.get(name) {
            self.constant(*value);
            return Ok(());
        }
        if let Some(member) = program.math_imports.get(name) {
            return self.math_value(member, line);
        }
        if let Some(err) = program.denied_imports.get(name) {
            return Err(err.clone());
        }
        if Some(name) == self.self_name {
            return Err(error(
                line,
                format!("'{name}' can only be used for attribute access and method calls"),
            ));
        }
        Err(error(line, format!("name '{name}' is not defined")))
    }

    fn math_value(&mut self, member: &str, line: usize) -> Result<()> {
        self.permit(Operation::ModuleMember {
            module: "math".to_string(),
            member: member.to_string(),
        })?;
        match math_constant(member) {
            Some(value) => {
                self.constant(value);
                Ok(())
            }
            None => Err(error(line, format!("math.{member} must be called"))),
        }
    }

    fn attribute(&mut self, value: &Expr, attr: &str, line: usize) -> Result<()> {
        let program = self.program;
        if self.is_self(value) {
            if program.attributes.contains_key(attr) {
                self.op(format!("global.get $a_{}", mangle(attr)));
                return Ok(());
            }
            if program.methods.contains_key(attr) {
                return Err(error(line, format!("method '{attr}' must be called")));
            }
            return Err(error(
                line,
                format!(
                    "attribute '{attr}' is not defined on class '{}'",
                    program.class_name
                ),
            ));
        }
        if self.is_math_alias(value) {
            return self.math_value(attr, line);
        }
        self.check_denied_import(value)?;
        self.permit(Operation::Attribute(attr.to_string()))?;
        if Field::from_name(attr).is_some() {
            return Err(error(
                line,
                format!("price series '{attr}' must be indexed, as in data.{attr}[i]"),
            ));
        }
        Err(error(line, format!("attribute '{attr}' must be called")))
    }

    fn index(&mut self, index: &Expr) -> Result<()> {
        if matches!(index.kind, ExprKind::Slice { .. }) {
            return Err(error(index.line, "slicing is not supported"));
        }
        self.expr(index)
    }

    fn subscript(&mut self, value: &Expr, index: &Expr) -> Result<()> {
        if let ExprKind::Attribute { value: inner, attr } = &value.kind
            && !self.is_self(inner)
            && !self.is_math_alias(inner)
            && let Some(field) = Field::from_name(attr)
        {
            self.permit(Operation::Attribute(attr.clone()))?;
            self.expr(inner)?;
            self.constant(f64::from(field.code()));
            self.index(index)?;
            self.op("call $rt_field");
            return Ok(());
        }
        self.expr(value)?;
        self.index(index)?;
        self.op("call $rt_get_item");
        Ok(())
    }

    fn call(&mut self, func: &Expr, args: &[Arg], line: usize) -> Result<()> {
        let program = self.program;
        match &func.kind {
            ExprKind::Attribute { value, attr } => {
                if self.is_self(value) {
                    let method = program.methods.get(attr).ok_or_else(|| {
                        error(
                            line,
                            format!(
                                "method '{attr}' is not defined on class '{}'",
                                program.class_name
                            ),
                        )
                    })?;
                    return self.call_user(method, args, line);
                }
                if self.is_math_alias(value) {
                    return self.math_call(attr, args, line);
                }
                self.check_denied_import(value)?;
                self.permit(Operation::Attribute(attr.clone()))?;
                if attr == "get" {
                    return self.map_get(value, args, line);
                }
                Err(error(line, format!("method '{attr}' is not supported")))
            }
            ExprKind::Name(name) => {
                if self.locals.contains(name) {
                    return Err(error(line, format!("'{name}' is not callable")));
                }
                if let Some(function) = program.functions.get(name) {
                    return self.call_user(function, args, line);
                }
                if let Some(member) = program.math_imports.get(name) {
                    return self.math_call(member, args, line);
                }
                if let Some(err) = program.denied_imports.get(name) {
                    return Err(err.clone());
                }
                self.builtin(name, args, line)
            }
            _ => Err(error(line, "unsupported call target")),
        }
    }

    fn call_user(&mut self, callable: &Callable<'_>, args: &[Arg], line: usize) -> Result<()> {
        let mut bound: Vec<(usize, &Expr)> = Vec::with_capacity(args.len());
        let mut next = 0;
        for arg in args {
            let slot = match arg {
                Arg::Positional(_) => {
                    next += 1;
                    next - 1
                }
                Arg::Keyword(name, _) => callable
                    .params
                    .iter()
                    .position(|p| p == name)
                    .ok_or_else(|| error(line, format!("unexpected keyword argument '{name}'")))?,
                Arg::Star(_) | Arg::DoubleStar(_) => {
                    return Err(error(line, "argument unpacking is not supported"));
                }
            };
            if slot >= callable.params.len() {
                return Err(error(
                    line,
                    format!("too many arguments to '{}'", callable.def.name),
                ));
            }
            if bound.iter().any(|(s, _)| *s == slot) {
                return Err(error(
                    line,
                    format!("multiple values for argument '{}'", callable.params[slot]),
                ));
            }
            bound.push((slot, arg.value()));
        }

        let in_order = bound.iter().enumerate().all(|(i, (slot, _))| i == *slot);
        let mut temps: HashMap<usize, String> = HashMap::new();
        if !in_order {
            for (slot, value) in &bound {
                self.expr(value)?;
                let temp = self.temp();
                self.op(format!("local.set {temp}"));
                temps.insert(*slot, temp);
            }
        }
        for slot in 0..callable.params.len() {
            if let Some(temp) = temps.get(&slot) {
                self.op(format!("local.get {temp}"));
            } else if let Some((_, value)) = bound.iter().find(|(s, _)| *s == slot) {
                self.expr(value)?;
            } else {
                let default = callable.defaults[slot].ok_or_else(|| {
                    error(
                        line,
                        format!(
                            "missing argument '{}' to '{}'",
                            callable.params[slot], callable.def.name
                        ),
                    )
                })?;
                self.constant(default);
            }
        }
        self.op(format!("call {}", callable.symbol));
        Ok(())
    }

    fn builtin(&mut self, name: &str, args: &[Arg], line: usize) -> Result<()> {
        match self
            .program
            .namespace
            .check(&Operation::CallBuiltin(name.to_string()))
        {
            Decision::Allow => {}
            Decision::Deny(reason)
                if reason.capability.is_none() && !BUILTIN_CATALOGUE.contains(&name) =>
            {
                return Err(error(line, format!("name '{name}' is not defined")));
            }
            denied => denied.into_result()?,
        }

        let args = positional(args, line)?;
        match (name, args.as_slice()) {
            ("abs", [x]) => {
                self.expr(x)?;
                self.op("f64.abs");
            }
            ("min" | "max", [first, rest @ ..]) if !rest.is_empty() => {
                self.expr(first)?;
                for value in rest {
                    self.expr(value)?;
                    self.op(if name == "min" { "f64.min" } else { "f64.max" });
                }
            }
            ("len", [x]) => {
                self.expr(x)?;
                self.op("call $rt_length");
            }
            ("round", [x]) => {
                self.expr(x)?;
                self.op("f64.nearest");
            }
            ("round", [x, digits]) => {
                let digits = self
                    .program
                    .fold(digits)
                    .filter(|d| d.fract() == 0.0 && d.abs() <= 300.0)
                    .ok_or_else(|| error(line, "round() digits must be an integer constant"))?;
                let scale = 10f64.powi(digits as i32);
                self.expr(x)?;
                self.constant(scale);
                self.op("f64.mul");
                self.op("f64.nearest");
                self.constant(scale);
                self.op("f64.div");
            }
            ("int" | "float" | "bool", []) => self.constant(0.0),
            ("int", [x]) => {
                self.expr(x)?;
                self.op("f64.trunc");
            }
            ("float", [x]) => self.expr(x)?,
            ("bool", [x]) => {
                self.cond(x)?;
                self.op("f64.convert_i32_u");
            }
            ("range", _) => {
                return Err(error(
                    line,
                    "range() is only supported as a for loop iterable",
                ));
            }
            _ => {
                return Err(error(
                    line,
                    format!("unsupported call to '{name}' with {} arguments", args.len()),
                ));
            }
        }
        Ok(())
    }

    fn host_math(&mut self, member: &str) {
        if let Some(name) = HOST_MATH_MEMBERS.iter().find(|m| **m == member) {
            self.host_math.insert(*name);
        }
    }

    fn math_call(&mut self, member: &str, args: &[Arg], line: usize) -> Result<()> {
        self.permit(Operation::ModuleMember {
            module: "math".to_string(),
            member: member.to_string(),
        })?;
        let args = positional(args, line)?;
        match (member, args.as_slice()) {
            ("sqrt" | "floor" | "ceil" | "trunc", [x]) => {
                self.expr(x)?;
                self.op(format!("f64.{member}"));
            }
            ("fabs", [x]) => {
                self.expr(x)?;
                self.op("f64.abs");
            }
            ("log", [x, base]) => {
                self.host_math("log");
                self.expr(x)?;
                self.op("call $math_log");
                self.expr(base)?;
                self.op("call $math_log");
                self.op("f64.div");
            }
            ("log" | "log10" | "exp" | "tanh", [x]) => {
                self.host_math(member);
                self.expr(x)?;
                self.op(format!("call $math_{member}"));
            }
            ("pow", [base, exponent]) => {
                self.host_math("pow");
                self.expr(base)?;
                self.expr(exponent)?;
                self.op("call $math_pow");
            }
            ("isnan" | "isfinite", [x]) => {
                let temp = self.temp();
                self.expr(x)?;
                self.op(format!("local.tee {temp}"));
                self.op(format!("local.get {temp}"));
                if member == "isnan" {
                    self.op("f64.ne");
                } else {
                    self.op("f64.sub");
                    self.constant(0.0);
                    self.op("f64.eq");
                }
                self.op("f64.convert_i32_u");
            }
            _ if math_constant(member).is_some() => {
                return Err(error(line, format!("math.{member} is not callable")));
            }
            _ => {
                return Err(error(
                    line,
                    format!(
                        "unsupported call to math.{member} with {} arguments",
                        args.len()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn map_get(&mut self, map: &Expr, args: &[Arg], line: usize) -> Result<()> {
        let args = positional(args, line)?;
        let (key, default) = match args.as_slice() {
            [key] => (*key, None),
            [key, default] => (*key, Some(*default)),
            _ => return Err(error(line, "get() takes a key and an optional default")),
        };
        self.expr(map)?;
        self.expr(key)?;
        match default {
            Some(default) => self.expr(default)?,
            None => self.constant(0.0),
        }
        self.op("call $rt_get_or");
        Ok(())
    }

    fn dict(&mut self, entries: &[(Option<Expr>, Expr)], line: usize) -> Result<()> {
        self.op("call $rt_new_map");
        if entries.is_empty() {
            return Ok(());
        }
        let map = self.temp();
        self.op(format!("local.set {map}"));
        for (key, value) in entries {
            let Some(key) = key else {
                return Err(error(line, "dict unpacking is not supported"));
            };
            self.op(format!("local.get {map}"));
            self.expr(key)?;
            self.expr(value)?;
            self.op("call $rt_set_item");
        }
        self.op(format!("local.get {map}"));
        Ok(())
    }

    fn bool_value(&mut self, op: BoolOp, values: &[Expr], line: usize) -> Result<()> {
        let (first, rest) = values
            .split_first()
            .ok_or_else(|| error(line, "empty boolean expression"))?;
        self.expr(first)?;
        for value in rest {
            let temp = self.temp();
            self.op(format!("local.tee {temp}"));
            self.constant(0.0);
            self.op("f64.ne");
            self.op("if (result f64)");
            match op {
                BoolOp::And => {
                    self.expr(value)?;
                    self.op("else");
                    self.op(format!("local.get {temp}"));
                }
                BoolOp::Or => {
                    self.op(format!("local.get {temp}"));
                    self.op("else");
                    self.expr(value)?;
                }
            }
            self.op("end");
        }
        Ok(())
    }

    fn cond(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Compare { left, ops } => self.compare(left, ops, expr.line),
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => {
                self.cond(operand)?;
                self.op("i32.eqz");
                Ok(())
            }
            ExprKind::Bool(b) => {
                self.op(format!("i32.const {}", u8::from(*b)));
                Ok(())
            }
            ExprKind::BoolOp { op, values } => self.cond_chain(*op, values, expr.line),
            _ => {
                self.expr(expr)?;
                self.constant(0.0);
                self.op("f64.ne");
                Ok(())
            }
        }
    }

    fn cond_chain(&mut self, op: BoolOp, values: &[Expr], line: usize) -> Result<()> {
        let (first, rest) = values
            .split_first()
            .ok_or_else(|| error(line, "empty boolean expression"))?;
        self.cond(first)?;
        if rest.is_empty() {
            return Ok(());
        }
        self.op("if (result i32)");
        match op {
            BoolOp::And => {
                self.cond_chain(op, rest, line)?;
                self.op("else");
                self.op("i32.const 0");
            }
            BoolOp::Or => {
                self.op("i32.const 1");
                self.op("else");
                self.cond_chain(op, rest, line)?;
            }
        }
        self.op("end");
        Ok(())
    }

    fn compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)], line: usize) -> Result<()> {
        if ops.is_empty() {
            return Err(error(line, "empty comparison"));
        }
        let mut previous = self.temp();
        self.expr(left)?;
        self.op(format!("local.set {previous}"));

        let chained = ops.len() > 1;
        let exit = format!("$cmp{}", self.label());
        if chained {
            self.op(format!("block {exit} (result i32)"));
        }
        for (i, (op, right)) in ops.iter().enumerate() {
            let current = self.temp();
            self.expr(right)?;
            self.op(format!("local.set {current}"));
            self.compare_pair(*op, &previous, &current);
            if i + 1 < ops.len() {
                self.op("i32.eqz");
                self.op("if");
                self.op("i32.const 0");
                self.op(format!("br {exit}"));
                self.op("end");
            }
            previous = current;
        }
        if chained {
            self.op("end");
        }
        Ok(())
    }

    fn compare_pair(&mut self, op: CmpOp, left: &str, right: &str) {
        if matches!(op, CmpOp::In | CmpOp::NotIn) {
            self.op(format!("local.get {right}"));
            self.op(format!("local.get {left}"));
            self.op("call $rt_contains");
            self.constant(0.0);
            self.op("f64.ne");
            if op == CmpOp::NotIn {
                self.op("i32.eqz");
            }
            return;
        }
        self.op(format!("local.get {left}"));
        self.op(format!("local.get {right}"));
        self.op(match op {
            CmpOp::Eq | CmpOp::Is => "f64.eq",
            CmpOp::NotEq | CmpOp::IsNot => "f64.ne",
            CmpOp::Lt => "f64.lt",
            CmpOp::LtE => "f64.le",
            CmpOp::Gt => "f64.gt",
            CmpOp::GtE | CmpOp::In | CmpOp::NotIn => "f64.ge",
        });
    }
}

fn positional(args: &[Arg], line: usize) -> Result<Vec<&Expr>> {
    args.iter()
        .map(|arg| match arg {
            Arg::Positional(expr) => Ok(expr),
            _ => Err(error(line, "only positional arguments are supported here")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionPolicy, build_namespace};

    fn compile_source(source: &str, class_name: &str) -> Result<CompiledStrategy> {
        let module = stratguard_script::parse(source).unwrap();
        let namespace = build_namespace(&PermissionPolicy::default());
        compile(&module, class_name, &namespace, &StrategyContract::standard())
    }

    const MOMENTUM: &str = r#"
import math
from math import sqrt as root

WINDOW = 2 * 2

def clamp(x, lo=-1, hi=1):
    return max(lo, min(hi, x))

class Momentum:
    """Signals from rate of change."""
    scale: float = 0.5

    def generate_signals(self, data, threshold=0.0, *args, **kwargs):
        out = {}
        self.count = 0
        for i in range(WINDOW, len(data)):
            change = data.close[i] / data.close[i - WINDOW] - 1
            if change > threshold and not math.isnan(change):
                out[i] = clamp(change * self.scale, hi=0.75)
                self.count += 1
            elif 0 < i <= 5:
                out[i] = 0
            else:
                out[i] = -root(abs(change)) if change < 0 else 0.0
        return out

    def calculate_scores(self, data):
        scores = {0: 1}
        i = 1
        while i < len(data):
            scores[i] = scores.get(i - 1, 0) + math.log(data[i], 10) * math.pi
            i += 1
            if i in scores:
                break
        return scores
"#;

    #[test]
    fn test_compiles_both_operations() {
        let compiled = compile_source(MOMENTUM, "Momentum").unwrap();
        assert_eq!(compiled.operations, StrategyOp::ALL.to_vec());
        assert!(compiled.wat.contains("(export \"generate_signals\")"));
        assert!(compiled.wat.contains("(export \"calculate_scores\")"));
        assert!(compiled.wat.contains("(import \"math\" \"log\""));
        assert!(!compiled.wat.contains("(import \"math\" \"exp\""));
        assert!(compiled.wat.contains("(global $a_scale (mut f64) (f64.const 0.5))"));
        assert!(compiled.wat.contains("(global $a_count (mut f64) (f64.const 0.0))"));
        assert!(compiled.wasm_hash.verify(&ContentHash::of_bytes(&compiled.wasm)));
    }

    #[test]
    fn test_missing_class() {
        let err = compile_source(MOMENTUM, "Nope").unwrap_err();
        assert!(err.is_compilation_error());
        assert!(err.to_string().contains("Nope"));
    }

    #[test]
    fn test_missing_required_operation() {
        let source = "class S:\n    def calculate_scores(self, data):\n        return {}\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.is_compilation_error());
        assert!(err.to_string().contains("generate_signals"));
    }

    #[test]
    fn test_entry_needs_data_parameter() {
        let source = "class S:\n    def generate_signals(self):\n        return {}\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.to_string().contains("market data"));

        let variadic = "class S(BaseStrategy):\n def generate_signals(self, *a): return {}";
        let compiled = compile_source(variadic, "S").unwrap();
        assert!(compiled.wat.contains("(export \"generate_signals\")"));
    }

    #[test]
    fn test_unsupported_constructs_report_line() {
        let source = "class S:\n    def generate_signals(self, data):\n        x = 1\n        try:\n            pass\n        except Exception:\n            pass\n        return {}\n";
        match compile_source(source, "S").unwrap_err() {
            Error::CompilationError { line, message } => {
                assert_eq!(line, Some(4));
                assert!(message.contains("try"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_denied_builtin_is_security_violation() {
        let source = "class S:\n    def generate_signals(self, data):\n        open(1)\n        return {}\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.is_security_violation());
        assert!(err.to_string().contains("filesystem"));
    }

    #[test]
    fn test_policy_denial_of_math_member() {
        let source =
            "import math\nclass S:\n    def generate_signals(self, data):\n        return {0: math.exp(1)}\n";
        let module = stratguard_script::parse(source).unwrap();
        let policy = PermissionPolicy::new(
            ["math"],
            ["len"],
            ["math.exp"],
        );
        let namespace = build_namespace(&policy);
        let err = compile(&module, "S", &namespace, &StrategyContract::standard()).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_denied_import_fails_only_where_used() {
        let unused = "import inspect\nclass S:\n    def generate_signals(self, data):\n        return {}\n";
        assert!(compile_source(unused, "S").is_ok());

        let used = "import inspect\nclass S:\n    def generate_signals(self, data):\n        return {0: inspect.stack()}\n";
        let err = compile_source(used, "S").unwrap_err();
        assert!(err.is_security_violation());

        let from = "from statistics import mean\nclass S:\n    def generate_signals(self, data):\n        return {0: mean(data)}\n";
        assert!(compile_source(from, "S").unwrap_err().is_security_violation());
    }

    #[test]
    fn test_undefined_name() {
        let source = "class S:\n    def generate_signals(self, data):\n        return helper(data)\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.is_compilation_error());
        assert!(err.to_string().contains("helper"));
    }

    #[test]
    fn test_non_range_iteration_rejected() {
        let source = "class S:\n    def generate_signals(self, data):\n        for x in data:\n            pass\n        return {}\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.to_string().contains("range"));
    }

    #[test]
    fn test_non_constant_class_attribute_rejected() {
        let source = "class S:\n    weights = {}\n    def generate_signals(self, data):\n        return {}\n";
        let err = compile_source(source, "S").unwrap_err();
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(f64_lit(1.0), "1.0");
        assert_eq!(f64_lit(f64::NAN), "nan");
        assert_eq!(f64_lit(f64::NEG_INFINITY), "-inf");
        assert_eq!(mangle("naïve"), "na~efve");
    }
}
