//! Recursive-descent parser for strategy scripts.
//!
//! The accepted grammar is deliberately wider than the compiled subset so
//! that the sanitizer sees (and scores) constructs the compiler would refuse.

use crate::SyntaxError;
use crate::ast::{
    Alias, Arg, BinOp, BoolOp, ClassDef, CmpOp, Comprehension, ExceptHandler, Expr, ExprKind,
    FunctionDef, Module, Param, ParamKind, Stmt, StmtKind, UnaryOp,
};
use crate::lexer::{Token, TokenKind, tokenize};

/// Maximum source size in bytes (denial-of-service protection).
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Maximum combined nesting of blocks and expressions.
pub const MAX_NESTING_DEPTH: usize = 64;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const AUGMENTED: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
    ("@=", BinOp::MatMul),
    ("&=", BinOp::BitAnd),
    ("|=", BinOp::BitOr),
    ("^=", BinOp::BitXor),
    ("<<=", BinOp::LShift),
    (">>=", BinOp::RShift),
];

/// Returns `true` for reserved words.
#[must_use]
pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Parses a complete source file.
///
/// # Errors
///
/// Returns [`SyntaxError`] for anything outside the grammar, for sources
/// larger than [`MAX_SOURCE_BYTES`] and for nesting deeper than
/// [`MAX_NESTING_DEPTH`].
///
/// # Examples
///
/// ```
/// use stratguard_script::ast::StmtKind;
/// use stratguard_script::parse;
///
/// let module = parse("class S(BaseStrategy):\n def generate_signals(self, *a): return {}\n")
///     .unwrap();
/// assert!(matches!(module.body[0].kind, StmtKind::ClassDef(_)));
/// ```
pub fn parse(source: &str) -> Result<Module, SyntaxError> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(SyntaxError::new(
            format!("source exceeds {MAX_SOURCE_BYTES} bytes"),
            1,
            1,
        ));
    }
    let tokens = tokenize(source)?;
    Parser::new(tokens, 0).module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

type PResult<T> = Result<T, SyntaxError>;

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
        }
    }

    // ---- token helpers -------------------------------------------------

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(message, token.line, token.column)
    }

    fn unexpected(&self) -> SyntaxError {
        self.error_here(format!("unexpected {}", self.peek().kind))
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<Token> {
        if self.is_op(op) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected '{op}', found {}", self.peek().kind)))
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Name(n) if n == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected '{kw}', found {}", self.peek().kind)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match &self.peek().kind {
            TokenKind::Name(n) if !is_keyword(n) => {
                let name = n.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here(format!("expected a name, found {}", self.peek().kind))),
        }
    }

    fn expect_newline(&mut self) -> PResult<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::EndMarker => Ok(()),
            _ => Err(self.error_here(format!("expected end of line, found {}", self.peek().kind))),
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::EndMarker) || self.is_op(";")
    }

    fn at_expr_end(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Newline | TokenKind::EndMarker => true,
            TokenKind::Op(op) => {
                matches!(*op, ")" | "]" | "}" | "=" | ";" | ":")
                    || AUGMENTED.iter().any(|(sym, _)| sym == op)
            }
            TokenKind::Name(n) => n == "in",
            _ => false,
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error_here("code is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ---- statements ----------------------------------------------------

    fn module(mut self) -> PResult<Module> {
        let mut body = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::EndMarker => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Module { body })
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let (line, column) = (self.peek().line, self.peek().column);
        let lead = match &self.peek().kind {
            TokenKind::Indent => return Err(self.error_here("unexpected indent")),
            TokenKind::Dedent => return Err(self.error_here("unexpected dedent")),
            TokenKind::Op("@") => "@".to_string(),
            TokenKind::Name(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match lead.as_str() {
            "@" => self.decorated()?,
            "if" => self.if_stmt()?,
            "while" => self.while_stmt()?,
            "for" => self.for_stmt()?,
            "def" => StmtKind::FunctionDef(self.function_def(Vec::new())?),
            "class" => StmtKind::ClassDef(self.class_def(Vec::new())?),
            "try" => self.try_stmt()?,
            "with" => self.with_stmt()?,
            "async" => return Err(self.error_here("async code is not supported")),
            _ => return self.simple_line(),
        };
        Ok(vec![Stmt { kind, line, column }])
    }

    fn simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.small_stmt()?];
        while self.eat_op(";") {
            if matches!(self.peek().kind, TokenKind::Newline | TokenKind::EndMarker) {
                break;
            }
            stmts.push(self.small_stmt()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.enter()?;
        let result = self.block_body();
        self.leave();
        result
    }

    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        if !matches!(self.peek().kind, TokenKind::Newline) {
            return self.simple_line();
        }
        self.advance();
        if !matches!(self.peek().kind, TokenKind::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndMarker => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn small_stmt(&mut self) -> PResult<Stmt> {
        let (line, column) = (self.peek().line, self.peek().column);
        let keyword = match &self.peek().kind {
            TokenKind::Name(n) if is_keyword(n) => Some(n.clone()),
            _ => None,
        };
        let kind = match keyword.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr_list()?))
                }
            }
            Some("raise") => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.expression()?;
                    if self.eat_keyword("from") {
                        let cause = self.expression()?;
                        StmtKind::Raise(Some(Expr::new(
                            ExprKind::Tuple(vec![exc, cause]),
                            line,
                            column,
                        )))
                    } else {
                        StmtKind::Raise(Some(exc))
                    }
                }
            }
            Some("global" | "nonlocal") => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if keyword.as_deref() == Some("global") {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            Some("del") => {
                self.advance();
                let mut targets = vec![self.bitor()?];
                while self.eat_op(",") {
                    if self.at_line_end() {
                        break;
                    }
                    targets.push(self.bitor()?);
                }
                StmtKind::Delete(targets)
            }
            Some("assert") => {
                self.advance();
                let test = self.expression()?;
                let msg = if self.eat_op(",") {
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Some("import") => {
                self.advance();
                let mut names = vec![self.dotted_alias()?];
                while self.eat_op(",") {
                    names.push(self.dotted_alias()?);
                }
                StmtKind::Import(names)
            }
            Some("from") => self.import_from()?,
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, line, column })
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn dotted_alias(&mut self) -> PResult<Alias> {
        let name = self.dotted_name()?;
        let asname = if self.eat_keyword("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if level > 0 && self.is_keyword("import") {
            String::new()
        } else {
            self.dotted_name()?
        };
        self.expect_keyword("import")?;

        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(Alias {
                name: "*".to_string(),
                asname: None,
            });
        } else {
            let parenthesized = self.eat_op("(");
            loop {
                let name = self.expect_name()?;
                let asname = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                names.push(Alias { name, asname });
                if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                    break;
                }
            }
            if parenthesized {
                self.expect_op(")")?;
            }
        }
        Ok(StmtKind::ImportFrom {
            module,
            names,
            level,
        })
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.expr_list()?;

        if self.eat_op(":") {
            let annotation = self.expression()?;
            let value = if self.eat_op("=") {
                Some(self.assign_value()?)
            } else {
                None
            };
            return Ok(StmtKind::AnnAssign {
                target: first,
                annotation,
                value,
            });
        }

        if let TokenKind::Op(op) = self.peek().kind
            && let Some((_, bin)) = AUGMENTED.iter().find(|(sym, _)| *sym == op)
        {
            let op = *bin;
            self.advance();
            let value = self.assign_value()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        if self.is_op("=") {
            let mut targets = vec![first];
            loop {
                self.advance();
                let next = self.assign_value()?;
                if self.is_op("=") {
                    targets.push(next);
                } else {
                    return Ok(StmtKind::Assign {
                        targets,
                        value: next,
                    });
                }
            }
        }

        Ok(StmtKind::Expr(first))
    }

    fn assign_value(&mut self) -> PResult<Expr> {
        if self.is_keyword("yield") {
            self.yield_expr()
        } else {
            self.expr_list()
        }
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let test = self.expression()?;
        let body = self.block()?;
        let orelse = if self.is_keyword("elif") {
            let (line, column) = (self.peek().line, self.peek().column);
            let nested = self.if_stmt()?;
            vec![Stmt {
                kind: nested,
                line,
                column,
            }]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let test = self.expression()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.expr_list()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn try_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.is_keyword("except") {
            let line = self.advance().line;
            let (kind, name) = if self.is_op(":") {
                (None, None)
            } else {
                let kind = self.expression()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body,
                line,
            });
        }
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn with_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut items = Vec::new();
        loop {
            let context = self.expression()?;
            let target = if self.eat_keyword("as") {
                Some(self.bitor()?)
            } else {
                None
            };
            items.push((context, target));
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.block()?;
        Ok(StmtKind::With { items, body })
    }

    fn decorated(&mut self) -> PResult<StmtKind> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.expression()?);
            self.expect_newline()?;
        }
        if self.is_keyword("def") {
            Ok(StmtKind::FunctionDef(self.function_def(decorators)?))
        } else if self.is_keyword("class") {
            Ok(StmtKind::ClassDef(self.class_def(decorators)?))
        } else {
            Err(self.error_here("expected 'def' or 'class' after decorator"))
        }
    }

    fn function_def(&mut self, decorators: Vec<Expr>) -> PResult<FunctionDef> {
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.expression()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            returns,
            body,
            decorators,
        })
    }

    fn params(&mut self, close: &str, annotations: bool) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        let mut keyword_only = false;
        while !self.is_op(close) {
            if self.eat_op("**") {
                let name = self.expect_name()?;
                let annotation = self.annotation(annotations)?;
                params.push(Param {
                    name,
                    kind: ParamKind::KwArgs,
                    annotation,
                    default: None,
                });
            } else if self.eat_op("*") {
                keyword_only = true;
                if !self.is_op(",") && !self.is_op(close) {
                    let name = self.expect_name()?;
                    let annotation = self.annotation(annotations)?;
                    params.push(Param {
                        name,
                        kind: ParamKind::VarArgs,
                        annotation,
                        default: None,
                    });
                }
            } else if self.eat_op("/") {
                // positional-only marker
            } else {
                let name = self.expect_name()?;
                let annotation = self.annotation(annotations)?;
                let default = if self.eat_op("=") {
                    Some(self.expression()?)
                } else {
                    None
                };
                params.push(Param {
                    name,
                    kind: if keyword_only {
                        ParamKind::KeywordOnly
                    } else {
                        ParamKind::Positional
                    },
                    annotation,
                    default,
                });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn annotation(&mut self, allowed: bool) -> PResult<Option<Expr>> {
        if allowed && self.eat_op(":") {
            Ok(Some(self.expression()?))
        } else {
            Ok(None)
        }
    }

    fn class_def(&mut self, decorators: Vec<Expr>) -> PResult<ClassDef> {
        self.advance();
        let name = self.expect_name()?;
        let mut bases = Vec::new();
        let mut keywords = Vec::new();
        if self.eat_op("(") {
            for arg in self.call_args()? {
                match arg {
                    Arg::Keyword(k, v) => keywords.push((k, v)),
                    Arg::DoubleStar(v) => keywords.push(("**".to_string(), v)),
                    Arg::Positional(v) | Arg::Star(v) => bases.push(v),
                }
            }
        }
        let body = self.block()?;
        Ok(ClassDef {
            name,
            bases,
            keywords,
            body,
            decorators,
        })
    }

    // ---- expressions ---------------------------------------------------

    /// `a, b, *c` (a tuple when a comma is present).
    fn expr_list(&mut self) -> PResult<Expr> {
        let first = self.star_or_expression()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let (line, column) = (first.line, first.column);
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.star_or_expression()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    /// Loop targets, stopping before `in`.
    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.star_or_bitor()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let (line, column) = (first.line, first.column);
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.star_or_bitor()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    fn star_or_expression(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        if self.eat_op("*") {
            let inner = self.bitor()?;
            return Ok(Expr::new(
                ExprKind::Starred(Box::new(inner)),
                token.line,
                token.column,
            ));
        }
        self.expression()
    }

    fn star_or_bitor(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        if self.eat_op("*") {
            let inner = self.bitor()?;
            return Ok(Expr::new(
                ExprKind::Starred(Box::new(inner)),
                token.line,
                token.column,
            ));
        }
        self.bitor()
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.expression_inner();
        self.leave();
        result
    }

    fn expression_inner(&mut self) -> PResult<Expr> {
        if self.is_keyword("lambda") {
            return self.lambda();
        }
        if self.is_keyword("yield") {
            return self.yield_expr();
        }
        let body = self.or_test()?;
        if self.is_op(":=") {
            self.advance();
            let value = self.expression()?;
            let (line, column) = (body.line, body.column);
            return Ok(Expr::new(
                ExprKind::NamedExpr {
                    target: Box::new(body),
                    value: Box::new(value),
                },
                line,
                column,
            ));
        }
        if self.eat_keyword("if") {
            let test = self.or_test()?;
            self.expect_keyword("else")?;
            let orelse = self.expression()?;
            let (line, column) = (body.line, body.column);
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
                column,
            ));
        }
        Ok(body)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let token = self.advance();
        let params = self.params(":", false)?;
        self.expect_op(":")?;
        let body = self.expression()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            token.line,
            token.column,
        ))
    }

    fn yield_expr(&mut self) -> PResult<Expr> {
        let token = self.advance();
        let value = if self.eat_keyword("from") {
            Some(Box::new(self.expression()?))
        } else if self.at_expr_end() || self.is_op(",") {
            None
        } else {
            Some(Box::new(self.expr_list()?))
        };
        Ok(Expr::new(ExprKind::Yield(value), token.line, token.column))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        self.bool_chain("or", BoolOp::Or, Self::and_test)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        self.bool_chain("and", BoolOp::And, Self::not_test)
    }

    fn bool_chain(
        &mut self,
        keyword: &str,
        op: BoolOp,
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let first = next(self)?;
        if !self.is_keyword(keyword) {
            return Ok(first);
        }
        let (line, column) = (first.line, first.column);
        let mut values = vec![first];
        while self.eat_keyword(keyword) {
            values.push(next(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op, values }, line, column))
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.is_keyword("not") {
            let token = self.advance();
            self.enter()?;
            let operand = self.not_test();
            self.leave();
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand?),
                },
                token.line,
                token.column,
            ));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let next_is_in =
            matches!(self.peek_nth(1).map(|t| &t.kind), Some(TokenKind::Name(m)) if m == "in");
        let op = match &self.peek().kind {
            TokenKind::Op("==") => CmpOp::Eq,
            TokenKind::Op("!=") => CmpOp::NotEq,
            TokenKind::Op("<") => CmpOp::Lt,
            TokenKind::Op("<=") => CmpOp::LtE,
            TokenKind::Op(">") => CmpOp::Gt,
            TokenKind::Op(">=") => CmpOp::GtE,
            TokenKind::Name(n) if n == "in" => CmpOp::In,
            TokenKind::Name(n) if n == "is" => CmpOp::Is,
            TokenKind::Name(n) if n == "not" && next_is_in => CmpOp::NotIn,
            _ => return None,
        };
        self.advance();
        match op {
            CmpOp::NotIn => {
                self.advance();
                Some(op)
            }
            CmpOp::Is if self.eat_keyword("not") => Some(CmpOp::IsNot),
            _ => Some(op),
        }
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.bitor()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.bitor()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let (line, column) = (left.line, left.column);
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
            column,
        ))
    }

    fn binary_chain(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        loop {
            let found = match &self.peek().kind {
                TokenKind::Op(op) => table.iter().find(|(sym, _)| sym == op).map(|(_, b)| *b),
                _ => None,
            };
            let Some(op) = found else {
                return Ok(left);
            };
            self.advance();
            let right = next(self)?;
            let (line, column) = (left.line, left.column);
            left = Expr::new(
                ExprKind::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                line,
                column,
            );
        }
    }

    fn bitor(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("|", BinOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("^", BinOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("<<", BinOp::LShift), (">>", BinOp::RShift)], Self::arith)
    }

    fn arith(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_chain(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
                ("@", BinOp::MatMul),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Op("-") => Some(UnaryOp::Neg),
            TokenKind::Op("+") => Some(UnaryOp::Pos),
            TokenKind::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.power();
        };
        let token = self.advance();
        self.enter()?;
        let operand = self.factor();
        self.leave();
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand?),
            },
            token.line,
            token.column,
        ))
    }

    fn power(&mut self) -> PResult<Expr> {
        if self.is_keyword("await") {
            let token = self.advance();
            let inner = self.power()?;
            return Ok(Expr::new(
                ExprKind::Await(Box::new(inner)),
                token.line,
                token.column,
            ));
        }
        let base = self.primary()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.factor();
            self.leave();
            let (line, column) = (base.line, base.column);
            return Ok(Expr::new(
                ExprKind::Binary {
                    left: Box::new(base),
                    op: BinOp::Pow,
                    right: Box::new(exponent?),
                },
                line,
                column,
            ));
        }
        Ok(base)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            let (line, column) = (expr.line, expr.column);
            if self.eat_op("(") {
                let args = self.call_args()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                    line,
                    column,
                );
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                    column,
                );
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                    column,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    /// Arguments after the opening parenthesis, consuming the closing one.
    fn call_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.is_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.expression()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.expression()?));
            } else if matches!(self.peek().kind, TokenKind::Name(_))
                && matches!(self.peek_nth(1).map(|t| &t.kind), Some(TokenKind::Op("=")))
            {
                let name = self.expect_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.expression()?));
            } else {
                let value = self.expression()?;
                if self.is_keyword("for") {
                    let generators = self.comprehension_clauses()?;
                    let (line, column) = (value.line, value.column);
                    args.push(Arg::Positional(Expr::new(
                        ExprKind::Comprehension {
                            elt: Box::new(value),
                            value: None,
                            generators,
                        },
                        line,
                        column,
                    )));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let first = self.slice_item()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let (line, column) = (first.line, first.column);
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    fn slice_bound(&mut self) -> PResult<Option<Box<Expr>>> {
        if self.is_op(":") || self.is_op("]") || self.is_op(",") {
            Ok(None)
        } else {
            Ok(Some(Box::new(self.expression()?)))
        }
    }

    fn slice_item(&mut self) -> PResult<Expr> {
        let (line, column) = (self.peek().line, self.peek().column);
        let lower = self.slice_bound()?;
        if !self.eat_op(":") {
            return lower.map(|b| *b).ok_or_else(|| self.unexpected());
        }
        let upper = self.slice_bound()?;
        let step = if self.eat_op(":") {
            self.slice_bound()?
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, line, column))
    }

    fn comprehension_clauses(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    /// Items after the first one of a bracketed literal, consuming `close`.
    fn rest_of_sequence(&mut self, first: Expr, close: &str) -> PResult<Vec<Expr>> {
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(close) {
                break;
            }
            items.push(self.star_or_expression()?);
        }
        self.expect_op(close)?;
        Ok(items)
    }

    fn comprehension(&mut self, elt: Expr, value: Option<Expr>, close: &str) -> PResult<Expr> {
        let generators = self.comprehension_clauses()?;
        self.expect_op(close)?;
        let (line, column) = (elt.line, elt.column);
        Ok(Expr::new(
            ExprKind::Comprehension {
                elt: Box::new(elt),
                value: value.map(Box::new),
                generators,
            },
            line,
            column,
        ))
    }

    fn atom(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let (line, column) = (token.line, token.column);
        let at = |kind: ExprKind| -> PResult<Expr> { Ok(Expr::new(kind, line, column)) };
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                at(ExprKind::Number(n))
            }
            TokenKind::Str { .. } => self.strings(),
            TokenKind::Name(name) => {
                let literal = match name.as_str() {
                    "True" => Some(ExprKind::Bool(true)),
                    "False" => Some(ExprKind::Bool(false)),
                    "None" => Some(ExprKind::NoneLit),
                    n if is_keyword(n) => {
                        return Err(self.error_here(format!("unexpected keyword '{n}'")));
                    }
                    _ => None,
                };
                self.advance();
                at(literal.unwrap_or(ExprKind::Name(name)))
            }
            TokenKind::Op("...") => {
                self.advance();
                at(ExprKind::Ellipsis)
            }
            TokenKind::Op("(") => {
                self.advance();
                if self.eat_op(")") {
                    return at(ExprKind::Tuple(Vec::new()));
                }
                if self.is_keyword("yield") {
                    let inner = self.yield_expr()?;
                    self.expect_op(")")?;
                    return Ok(inner);
                }
                let first = self.star_or_expression()?;
                if self.is_keyword("for") {
                    return self.comprehension(first, None, ")");
                }
                if self.is_op(",") {
                    let items = self.rest_of_sequence(first, ")")?;
                    return at(ExprKind::Tuple(items));
                }
                self.expect_op(")")?;
                Ok(first)
            }
            TokenKind::Op("[") => {
                self.advance();
                if self.eat_op("]") {
                    return at(ExprKind::List(Vec::new()));
                }
                let first = self.star_or_expression()?;
                if self.is_keyword("for") {
                    return self.comprehension(first, None, "]");
                }
                let items = self.rest_of_sequence(first, "]")?;
                at(ExprKind::List(items))
            }
            TokenKind::Op("{") => {
                self.advance();
                self.braces(line, column)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn braces(&mut self, line: usize, column: usize) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), line, column));
        }
        let first_key = if self.eat_op("**") {
            None
        } else {
            Some(self.star_or_expression()?)
        };

        let is_dict = first_key.is_none() || self.is_op(":");
        if !is_dict {
            let first = first_key.ok_or_else(|| self.unexpected())?;
            if self.is_keyword("for") {
                return self.comprehension(first, None, "}");
            }
            let items = self.rest_of_sequence(first, "}")?;
            return Ok(Expr::new(ExprKind::Set(items), line, column));
        }

        let mut entries = Vec::new();
        let mut key = first_key;
        loop {
            match key {
                Some(k) => {
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    if entries.is_empty() && self.is_keyword("for") {
                        return self.comprehension(k, Some(value), "}");
                    }
                    entries.push((Some(k), value));
                }
                None => entries.push((None, self.bitor()?)),
            }
            if !self.eat_op(",") || self.is_op("}") {
                break;
            }
            key = if self.eat_op("**") {
                None
            } else {
                Some(self.expression()?)
            };
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Dict(entries), line, column))
    }

    /// Adjacent string literals concatenate; any f-string part makes the
    /// whole literal an f-string.
    fn strings(&mut self) -> PResult<Expr> {
        let first = self.peek().clone();
        let mut text = String::new();
        let mut interpolations = Vec::new();
        let mut formatted = false;
        while let TokenKind::Str { value, fstring } = &self.peek().kind {
            let (value, fstring, line) = (value.clone(), *fstring, self.peek().line);
            self.advance();
            if fstring {
                formatted = true;
                for source in fstring_fields(&value, line, first.column)? {
                    interpolations.push(self.sub_expression(&source, line)?);
                }
            } else {
                text.push_str(&value);
            }
        }
        let kind = if formatted {
            ExprKind::FString(interpolations)
        } else {
            ExprKind::Str(text)
        };
        Ok(Expr::new(kind, first.line, first.column))
    }

    fn sub_expression(&self, source: &str, line: usize) -> PResult<Expr> {
        let mut tokens = tokenize(source.trim()).map_err(|e| shift_error(e, line))?;
        for token in &mut tokens {
            token.line += line - 1;
        }
        let mut parser = Self::new(tokens, self.depth + 1);
        let expr = parser.expr_list()?;
        parser.expect_newline()?;
        if !matches!(parser.peek().kind, TokenKind::EndMarker) {
            return Err(parser.unexpected());
        }
        Ok(expr)
    }
}

fn shift_error(mut err: SyntaxError, line: usize) -> SyntaxError {
    err.line += line - 1;
    err
}

/// Extracts the expression sources of `{...}` fields in an f-string body,
/// including fields nested in format specs.
fn fstring_fields(body: &str, line: usize, column: usize) -> PResult<Vec<String>> {
    let chars: Vec<char> = body.chars().collect();
    let mut fields = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => i += 2,
            '}' if chars.get(i + 1) == Some(&'}') => i += 2,
            '{' => {
                let (expr, spec, end) = split_field(&chars, i + 1)
                    .ok_or_else(|| SyntaxError::new("unterminated f-string field", line, column))?;
                if expr.trim().is_empty() {
                    return Err(SyntaxError::new("empty f-string field", line, column));
                }
                fields.push(expr);
                if let Some(spec) = spec {
                    fields.extend(fstring_fields(&spec, line, column)?);
                }
                i = end + 1;
            }
            _ => i += 1,
        }
    }
    Ok(fields)
}

/// Splits one field starting after `{` into its expression and format spec.
/// Returns the index of the closing `}`.
fn split_field(chars: &[char], start: usize) -> Option<(String, Option<String>, usize)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else {
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '}' if depth > 0 => depth -= 1,
                '}' => {
                    let expr_end = expr_end.unwrap_or(i);
                    let expr = strip_conversion(&chars[start..expr_end]);
                    let spec = (expr_end < i)
                        .then(|| chars[expr_end + 1..i].iter().collect::<String>())
                        .filter(|s| !s.is_empty());
                    return Some((expr, spec, i));
                }
                ':' if depth == 0 && expr_end.is_none() => expr_end = Some(i),
                '!' if depth == 0
                    && expr_end.is_none()
                    && matches!(chars.get(i + 1), Some('r' | 's' | 'a'))
                    && matches!(chars.get(i + 2), Some(':' | '}')) =>
                {
                    // conversion: `!r` is dropped with the rest of the field tail
                    let expr: String = chars[start..i].iter().collect();
                    let close = chars[i..].iter().position(|&c| c == '}')? + i;
                    let spec = (chars.get(i + 2) == Some(&':'))
                        .then(|| chars[i + 3..close].iter().collect::<String>())
                        .filter(|s| !s.is_empty());
                    return Some((strip_debug(&expr), spec, close));
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn strip_conversion(chars: &[char]) -> String {
    strip_debug(&chars.iter().collect::<String>())
}

/// `f"{x=}"` prints `x=`; the expression is `x`.
fn strip_debug(expr: &str) -> String {
    let trimmed = expr.trim_end();
    match trimmed.strip_suffix('=') {
        Some(rest) if !rest.ends_with(['=', '!', '<', '>']) => rest.to_string(),
        _ => expr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        match parse(source) {
            Ok(m) => m,
            Err(e) => panic!("parse failed: {e}\n{source}"),
        }
    }

    fn first_expr(source: &str) -> Expr {
        match parse_ok(source).body.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(e)) => e,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn test_one_line_method_with_star_params() {
        let module = parse_ok("class S(BaseStrategy):\n def generate_signals(self, *a): return {}\n");
        let StmtKind::ClassDef(class) = &module.body[0].kind else {
            panic!("expected class");
        };
        assert_eq!(class.name, "S");
        let StmtKind::FunctionDef(func) = &class.body[0].kind else {
            panic!("expected method");
        };
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.params[1].kind, ParamKind::VarArgs);
        assert!(matches!(
            func.body[0].kind,
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Dict(_),
                ..
            }))
        ));
    }

    #[test]
    fn test_operator_precedence() {
        let expr = first_expr("1 + 2 * 3 ** -4\n");
        let ExprKind::Binary { op, right, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        let ExprKind::Binary { op, right, .. } = right.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Mul);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_chained_comparison_and_membership() {
        let expr = first_expr("a < b <= c not in d is not e\n");
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected compare");
        };
        let kinds: Vec<CmpOp> = ops.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            kinds,
            vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn, CmpOp::IsNot]
        );
    }

    #[test]
    fn test_boolean_and_conditional() {
        let expr = first_expr("x if a and not b or c else y\n");
        let ExprKind::IfExp { test, .. } = expr.kind else {
            panic!("expected conditional");
        };
        assert!(matches!(test.kind, ExprKind::BoolOp { op: BoolOp::Or, .. }));
    }

    #[test]
    fn test_imports() {
        let module = parse_ok("import os.path as p, sys\nfrom ..pkg import (a as b, c,)\nfrom x import *\n");
        let StmtKind::Import(names) = &module.body[0].kind else {
            panic!("expected import");
        };
        assert_eq!(names[0].name, "os.path");
        assert_eq!(names[0].bound_name(), "p");
        let StmtKind::ImportFrom { module: m, names, level } = &module.body[1].kind else {
            panic!("expected from-import");
        };
        assert_eq!((m.as_str(), *level, names.len()), ("pkg", 2, 2));
        assert!(matches!(&module.body[2].kind, StmtKind::ImportFrom { names, .. } if names[0].name == "*"));
    }

    #[test]
    fn test_assignment_forms() {
        let module = parse_ok("a = b = 1\nx: float = 2.0\ny += 3\na, b = b, a\n");
        assert!(matches!(&module.body[0].kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
        assert!(matches!(module.body[1].kind, StmtKind::AnnAssign { .. }));
        assert!(matches!(
            module.body[2].kind,
            StmtKind::AugAssign { op: BinOp::Add, .. }
        ));
        assert!(matches!(
            &module.body[3].kind,
            StmtKind::Assign { targets, value: Expr { kind: ExprKind::Tuple(_), .. } }
                if matches!(targets[0].kind, ExprKind::Tuple(_))
        ));
    }

    #[test]
    fn test_compound_statements() {
        let source = "\
for i in range(10):
    if i % 2 == 0:
        continue
    elif i > 7:
        break
    else:
        pass
while True:
    break
try:
    x = 1
except ValueError as err:
    raise
finally:
    pass
with ctx() as c, other():
    del c
";
        let module = parse_ok(source);
        assert_eq!(module.body.len(), 4);
        assert!(matches!(module.body[2].kind, StmtKind::Try { .. }));
    }

    #[test]
    fn test_decorators_and_lambda() {
        let module = parse_ok("@wrap(1)\ndef f(x, y=2, *, z, **kw) -> int:\n    return lambda q, r=1: q + r\n");
        let StmtKind::FunctionDef(func) = &module.body[0].kind else {
            panic!("expected function");
        };
        assert_eq!(func.decorators.len(), 1);
        let kinds: Vec<ParamKind> = func.params.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParamKind::Positional,
                ParamKind::Positional,
                ParamKind::KeywordOnly,
                ParamKind::KwArgs
            ]
        );
    }

    #[test]
    fn test_collections_and_comprehensions() {
        assert!(matches!(first_expr("{}\n").kind, ExprKind::Dict(ref e) if e.is_empty()));
        assert!(matches!(first_expr("{1, 2}\n").kind, ExprKind::Set(_)));
        assert!(matches!(first_expr("{'a': 1, **d}\n").kind, ExprKind::Dict(ref e) if e.len() == 2));
        assert!(matches!(first_expr("(1,)\n").kind, ExprKind::Tuple(ref t) if t.len() == 1));
        assert!(matches!(first_expr("(1)\n").kind, ExprKind::Number(_)));
        assert!(matches!(
            first_expr("[x * 2 for x in xs if x > 0]\n").kind,
            ExprKind::Comprehension { .. }
        ));
        assert!(matches!(
            first_expr("{k: v for k, v in items}\n").kind,
            ExprKind::Comprehension { value: Some(_), .. }
        ));
        assert!(matches!(
            first_expr("sum(x for x in xs)\n").kind,
            ExprKind::Call { .. }
        ));
    }

    #[test]
    fn test_subscripts_and_slices() {
        let expr = first_expr("data.close[-1]\n");
        assert!(matches!(expr.kind, ExprKind::Subscript { .. }));
        let expr = first_expr("a[1:2, ::3]\n");
        let ExprKind::Subscript { index, .. } = expr.kind else {
            panic!("expected subscript");
        };
        assert!(matches!(index.kind, ExprKind::Tuple(ref items) if items.len() == 2));
    }

    #[test]
    fn test_call_arguments() {
        let expr = first_expr("f(a, b=1, *c, **d)\n");
        let ExprKind::Call { args, .. } = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(args[0], Arg::Positional(_)));
        assert!(matches!(args[1], Arg::Keyword(ref k, _) if k == "b"));
        assert!(matches!(args[2], Arg::Star(_)));
        assert!(matches!(args[3], Arg::DoubleStar(_)));
    }

    #[test]
    fn test_fstring_fields_are_parsed() {
        let expr = first_expr("f'{a.b!r} and {c:{width}} {{literal}} {d=}'\n");
        let ExprKind::FString(parts) = expr.kind else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(parts[0].kind, ExprKind::Attribute { .. }));
        assert_eq!(parts[2].as_name(), Some("width"));
        assert_eq!(parts[3].as_name(), Some("d"));
    }

    #[test]
    fn test_fstring_call_inside_field() {
        let expr = first_expr("f\"{__import__('os').system('id')}\"\n");
        let ExprKind::FString(parts) = expr.kind else {
            panic!("expected f-string");
        };
        assert!(matches!(parts[0].kind, ExprKind::Call { .. }));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            first_expr("'a' \"b\"\n").kind,
            ExprKind::Str("ab".to_string())
        );
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse("x = (1 +\n").unwrap_err();
        assert!(err.line >= 1);
        let err = parse("def f(,):\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);
        let err = parse("if x:\npass\n").unwrap_err();
        assert!(err.message.contains("indented block"));
        let err = parse("  x = 1\n").unwrap_err();
        assert!(err.message.contains("indent"));
    }

    #[test]
    fn test_keyword_as_name_rejected() {
        assert!(parse("class = 1\n").is_err());
        assert!(parse("x.import\n").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("x = {}1\n", "-".repeat(MAX_NESTING_DEPTH + 5));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nested"));
        let nots = format!("x = {}y\n", "not ".repeat(MAX_NESTING_DEPTH + 5));
        assert!(parse(&nots).is_err());
    }

    #[test]
    fn test_source_size_limit() {
        let big = "#".repeat(MAX_SOURCE_BYTES + 1);
        assert!(parse(&big).is_err());
    }

    #[test]
    fn test_semicolon_separated_statements() {
        let module = parse_ok("a = 1; b = 2;\n");
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn test_empty_source() {
        assert!(parse_ok("").body.is_empty());
        assert!(parse_ok("\n\n# only a comment\n").body.is_empty());
    }
}
