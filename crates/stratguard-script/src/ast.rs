//! Syntax tree for strategy scripts.
//!
//! Every statement and expression carries its 1-based source position so
//! that sanitizer findings and compilation errors can point at the code.
//! [`Visitor`] walks the whole tree; override a method and call the matching
//! `walk_*` function to keep descending.

/// A parsed source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Top-level statements
    pub body: Vec<Stmt>,
}

/// A statement with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Statement variant
    pub kind: StmtKind,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
}

/// `name [as asname]` in an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Dotted name
    pub name: String,
    /// Binding name, when renamed
    pub asname: Option<String>,
}

impl Alias {
    /// First component of the dotted name.
    #[must_use]
    pub fn root(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Name bound in the enclosing scope.
    #[must_use]
    pub fn bound_name(&self) -> &str {
        self.asname.as_deref().unwrap_or_else(|| self.root())
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `import a.b as c, d`
    Import(Vec<Alias>),
    /// `from [.]a import b as c`
    ImportFrom {
        /// Module path without leading dots
        module: String,
        /// Imported names (`*` for a star import)
        names: Vec<Alias>,
        /// Number of leading dots
        level: usize,
    },
    /// `class N(bases): ...`
    ClassDef(ClassDef),
    /// `def f(params): ...`
    FunctionDef(FunctionDef),
    /// `return [value]`
    Return(Option<Expr>),
    /// `pass`
    Pass,
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `if`/`elif`/`else`
    If {
        /// Condition
        test: Expr,
        /// Taken branch
        body: Vec<Stmt>,
        /// `else` branch (an `elif` is a nested `If`)
        orelse: Vec<Stmt>,
    },
    /// `while test: ... else: ...`
    While {
        /// Condition
        test: Expr,
        /// Loop body
        body: Vec<Stmt>,
        /// `else` branch
        orelse: Vec<Stmt>,
    },
    /// `for target in iter: ... else: ...`
    For {
        /// Loop variable(s)
        target: Expr,
        /// Iterated expression
        iter: Expr,
        /// Loop body
        body: Vec<Stmt>,
        /// `else` branch
        orelse: Vec<Stmt>,
    },
    /// `try: ... except ...: ... else: ... finally: ...`
    Try {
        /// Protected block
        body: Vec<Stmt>,
        /// Handlers
        handlers: Vec<ExceptHandler>,
        /// `else` branch
        orelse: Vec<Stmt>,
        /// `finally` branch
        finalbody: Vec<Stmt>,
    },
    /// `with a as b, c: ...`
    With {
        /// Context expressions and their optional targets
        items: Vec<(Expr, Option<Expr>)>,
        /// Block
        body: Vec<Stmt>,
    },
    /// `raise [exc]`
    Raise(Option<Expr>),
    /// `assert test[, msg]`
    Assert {
        /// Asserted condition
        test: Expr,
        /// Optional message
        msg: Option<Expr>,
    },
    /// `del a, b`
    Delete(Vec<Expr>),
    /// `global a, b`
    Global(Vec<String>),
    /// `nonlocal a, b`
    Nonlocal(Vec<String>),
    /// `a = b = value`
    Assign {
        /// Targets, left to right
        targets: Vec<Expr>,
        /// Assigned value
        value: Expr,
    },
    /// `target: annotation [= value]`
    AnnAssign {
        /// Target
        target: Expr,
        /// Annotation
        annotation: Expr,
        /// Value, if assigned
        value: Option<Expr>,
    },
    /// `target op= value`
    AugAssign {
        /// Target
        target: Expr,
        /// Operator
        op: BinOp,
        /// Right-hand side
        value: Expr,
    },
    /// Bare expression
    Expr(Expr),
}

/// `except [type [as name]]: ...`
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    /// Exception type filter
    pub kind: Option<Expr>,
    /// Bound name
    pub name: Option<String>,
    /// Handler block
    pub body: Vec<Stmt>,
    /// 1-based line
    pub line: usize,
}

/// Class definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    /// Class name
    pub name: String,
    /// Base class expressions
    pub bases: Vec<Expr>,
    /// Keyword arguments in the class header (`metaclass=...`)
    pub keywords: Vec<(String, Expr)>,
    /// Class body
    pub body: Vec<Stmt>,
    /// Decorator expressions
    pub decorators: Vec<Expr>,
}

/// Function or method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Parameters in declaration order
    pub params: Vec<Param>,
    /// Return annotation
    pub returns: Option<Expr>,
    /// Function body
    pub body: Vec<Stmt>,
    /// Decorator expressions
    pub decorators: Vec<Expr>,
}

/// How a parameter binds arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Ordinary positional-or-keyword parameter
    Positional,
    /// `*args`
    VarArgs,
    /// Parameter after `*` or `*args`
    KeywordOnly,
    /// `**kwargs`
    KwArgs,
}

/// One formal parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Binding kind
    pub kind: ParamKind,
    /// Annotation
    pub annotation: Option<Expr>,
    /// Default value
    pub default: Option<Expr>,
}

/// An expression with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Expression variant
    pub kind: ExprKind,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
}

impl Expr {
    /// Creates an expression.
    #[must_use]
    pub const fn new(kind: ExprKind, line: usize, column: usize) -> Self {
        Self { kind, line, column }
    }

    /// Name if this is a bare identifier.
    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(name) => Some(name),
            _ => None,
        }
    }
}

/// Call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// `value`
    Positional(Expr),
    /// `name=value`
    Keyword(String, Expr),
    /// `*value`
    Star(Expr),
    /// `**value`
    DoubleStar(Expr),
}

impl Arg {
    /// The argument expression.
    #[must_use]
    pub const fn value(&self) -> &Expr {
        match self {
            Self::Positional(e) | Self::Keyword(_, e) | Self::Star(e) | Self::DoubleStar(e) => e,
        }
    }
}

/// `for target in iter if cond` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    /// Loop variable(s)
    pub target: Expr,
    /// Iterated expression
    pub iter: Expr,
    /// Filters
    pub ifs: Vec<Expr>,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Pos,
    /// `not x`
    Not,
    /// `~x`
    Invert,
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `@`
    MatMul,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
}

impl BinOp {
    /// Operator spelling.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::MatMul => "@",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::LShift => "<<",
            Self::RShift => ">>",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtE,
    /// `>`
    Gt,
    /// `>=`
    GtE,
    /// `in`
    In,
    /// `not in`
    NotIn,
    /// `is`
    Is,
    /// `is not`
    IsNot,
}

/// `and` / `or`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    /// `and`
    And,
    /// `or`
    Or,
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Numeric literal
    Number(f64),
    /// String or bytes literal
    Str(String),
    /// f-string; the interpolated expressions in order
    FString(Vec<Expr>),
    /// `True` / `False`
    Bool(bool),
    /// `None`
    NoneLit,
    /// `...`
    Ellipsis,
    /// Identifier
    Name(String),
    /// `value.attr`
    Attribute {
        /// Receiver
        value: Box<Expr>,
        /// Attribute name
        attr: String,
    },
    /// `value[index]`
    Subscript {
        /// Receiver
        value: Box<Expr>,
        /// Index (a `Slice` or `Tuple` for extended forms)
        index: Box<Expr>,
    },
    /// `lower:upper:step` inside a subscript
    Slice {
        /// Lower bound
        lower: Option<Box<Expr>>,
        /// Upper bound
        upper: Option<Box<Expr>>,
        /// Step
        step: Option<Box<Expr>>,
    },
    /// `func(args)`
    Call {
        /// Callee
        func: Box<Expr>,
        /// Arguments
        args: Vec<Arg>,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Left operand
        left: Box<Expr>,
        /// Operator
        op: BinOp,
        /// Right operand
        right: Box<Expr>,
    },
    /// Chained comparison `a < b <= c`
    Compare {
        /// First operand
        left: Box<Expr>,
        /// Remaining operators and operands
        ops: Vec<(CmpOp, Expr)>,
    },
    /// `a and b and c`
    BoolOp {
        /// Operator
        op: BoolOp,
        /// Operands (at least two)
        values: Vec<Expr>,
    },
    /// `body if test else orelse`
    IfExp {
        /// Condition
        test: Box<Expr>,
        /// Value when true
        body: Box<Expr>,
        /// Value when false
        orelse: Box<Expr>,
    },
    /// `lambda params: body`
    Lambda {
        /// Parameters
        params: Vec<Param>,
        /// Body expression
        body: Box<Expr>,
    },
    /// `[a, b]`
    List(Vec<Expr>),
    /// `(a, b)` or bare `a, b`
    Tuple(Vec<Expr>),
    /// `{a, b}`
    Set(Vec<Expr>),
    /// `{k: v, **d}`; a `None` key marks a `**` unpacking
    Dict(Vec<(Option<Expr>, Expr)>),
    /// `[elt for ...]`, `{elt for ...}`, `(elt for ...)`
    Comprehension {
        /// Produced element (`key` for dict comprehensions)
        elt: Box<Expr>,
        /// Value of a dict comprehension
        value: Option<Box<Expr>>,
        /// `for` clauses
        generators: Vec<Comprehension>,
    },
    /// `*value` in a literal or target
    Starred(Box<Expr>),
    /// `yield [value]`
    Yield(Option<Box<Expr>>),
    /// `await value`
    Await(Box<Expr>),
    /// `name := value`
    NamedExpr {
        /// Bound name
        target: Box<Expr>,
        /// Value
        value: Box<Expr>,
    },
}

/// Tree walker. Every method defaults to visiting the node's children.
pub trait Visitor {
    /// Visits a statement.
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    /// Visits an expression.
    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }
}

/// Visits all statements of a module.
pub fn walk_module<V: Visitor + ?Sized>(visitor: &mut V, module: &Module) {
    for stmt in &module.body {
        visitor.visit_stmt(stmt);
    }
}

fn walk_block<V: Visitor + ?Sized>(visitor: &mut V, body: &[Stmt]) {
    for stmt in body {
        visitor.visit_stmt(stmt);
    }
}

fn walk_params<V: Visitor + ?Sized>(visitor: &mut V, params: &[Param]) {
    for param in params {
        if let Some(annotation) = &param.annotation {
            visitor.visit_expr(annotation);
        }
        if let Some(default) = &param.default {
            visitor.visit_expr(default);
        }
    }
}

/// Visits the children of a statement.
pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_) => {}
        StmtKind::ClassDef(class) => {
            for e in class.decorators.iter().chain(&class.bases) {
                visitor.visit_expr(e);
            }
            for (_, e) in &class.keywords {
                visitor.visit_expr(e);
            }
            walk_block(visitor, &class.body);
        }
        StmtKind::FunctionDef(func) => {
            for e in &func.decorators {
                visitor.visit_expr(e);
            }
            walk_params(visitor, &func.params);
            if let Some(returns) = &func.returns {
                visitor.visit_expr(returns);
            }
            walk_block(visitor, &func.body);
        }
        StmtKind::Return(value) | StmtKind::Raise(value) => {
            if let Some(e) = value {
                visitor.visit_expr(e);
            }
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            visitor.visit_expr(test);
            walk_block(visitor, body);
            walk_block(visitor, orelse);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(iter);
            walk_block(visitor, body);
            walk_block(visitor, orelse);
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            walk_block(visitor, body);
            for handler in handlers {
                if let Some(kind) = &handler.kind {
                    visitor.visit_expr(kind);
                }
                walk_block(visitor, &handler.body);
            }
            walk_block(visitor, orelse);
            walk_block(visitor, finalbody);
        }
        StmtKind::With { items, body } => {
            for (context, target) in items {
                visitor.visit_expr(context);
                if let Some(t) = target {
                    visitor.visit_expr(t);
                }
            }
            walk_block(visitor, body);
        }
        StmtKind::Assert { test, msg } => {
            visitor.visit_expr(test);
            if let Some(m) = msg {
                visitor.visit_expr(m);
            }
        }
        StmtKind::Delete(targets) => {
            for t in targets {
                visitor.visit_expr(t);
            }
        }
        StmtKind::Assign { targets, value } => {
            for t in targets {
                visitor.visit_expr(t);
            }
            visitor.visit_expr(value);
        }
        StmtKind::AnnAssign {
            target,
            annotation,
            value,
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(annotation);
            if let Some(v) = value {
                visitor.visit_expr(v);
            }
        }
        StmtKind::AugAssign { target, value, .. } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
        StmtKind::Expr(e) => visitor.visit_expr(e),
    }
}

/// Visits the children of an expression.
pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Number(_)
        | ExprKind::Str(_)
        | ExprKind::Bool(_)
        | ExprKind::NoneLit
        | ExprKind::Ellipsis
        | ExprKind::Name(_) => {}
        ExprKind::FString(parts)
        | ExprKind::List(parts)
        | ExprKind::Tuple(parts)
        | ExprKind::Set(parts) => {
            for e in parts {
                visitor.visit_expr(e);
            }
        }
        ExprKind::Attribute { value, .. }
        | ExprKind::Starred(value)
        | ExprKind::Await(value) => visitor.visit_expr(value),
        ExprKind::Unary { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Subscript { value, index } => {
            visitor.visit_expr(value);
            visitor.visit_expr(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            for e in [lower, upper, step].into_iter().flatten() {
                visitor.visit_expr(e);
            }
        }
        ExprKind::Call { func, args } => {
            visitor.visit_expr(func);
            for arg in args {
                visitor.visit_expr(arg.value());
            }
        }
        ExprKind::Binary { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        ExprKind::Compare { left, ops } => {
            visitor.visit_expr(left);
            for (_, e) in ops {
                visitor.visit_expr(e);
            }
        }
        ExprKind::BoolOp { values, .. } => {
            for e in values {
                visitor.visit_expr(e);
            }
        }
        ExprKind::IfExp { test, body, orelse } => {
            visitor.visit_expr(test);
            visitor.visit_expr(body);
            visitor.visit_expr(orelse);
        }
        ExprKind::Lambda { params, body } => {
            walk_params(visitor, params);
            visitor.visit_expr(body);
        }
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                if let Some(k) = key {
                    visitor.visit_expr(k);
                }
                visitor.visit_expr(value);
            }
        }
        ExprKind::Comprehension {
            elt,
            value,
            generators,
        } => {
            for generator in generators {
                visitor.visit_expr(&generator.target);
                visitor.visit_expr(&generator.iter);
                for cond in &generator.ifs {
                    visitor.visit_expr(cond);
                }
            }
            visitor.visit_expr(elt);
            if let Some(v) = value {
                visitor.visit_expr(v);
            }
        }
        ExprKind::Yield(value) => {
            if let Some(v) = value {
                visitor.visit_expr(v);
            }
        }
        ExprKind::NamedExpr { target, value } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NameCollector(Vec<String>);

    impl Visitor for NameCollector {
        fn visit_expr(&mut self, expr: &Expr) {
            if let Some(name) = expr.as_name() {
                self.0.push(name.to_string());
            }
            walk_expr(self, expr);
        }
    }

    fn name(n: &str) -> Expr {
        Expr::new(ExprKind::Name(n.to_string()), 1, 1)
    }

    #[test]
    fn test_visitor_reaches_nested_call_args() {
        let call = Expr::new(
            ExprKind::Call {
                func: Box::new(name("f")),
                args: vec![
                    Arg::Positional(name("a")),
                    Arg::Keyword("k".to_string(), name("b")),
                ],
            },
            1,
            1,
        );
        let module = Module {
            body: vec![Stmt {
                kind: StmtKind::Expr(call),
                line: 1,
                column: 1,
            }],
        };
        let mut collector = NameCollector(Vec::new());
        walk_module(&mut collector, &module);
        assert_eq!(collector.0, vec!["f", "a", "b"]);
    }

    #[test]
    fn test_alias_binding() {
        let plain = Alias {
            name: "os.path".to_string(),
            asname: None,
        };
        assert_eq!(plain.root(), "os");
        assert_eq!(plain.bound_name(), "os");
        let renamed = Alias {
            name: "os.path".to_string(),
            asname: Some("p".to_string()),
        };
        assert_eq!(renamed.bound_name(), "p");
    }
}
