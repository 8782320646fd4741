//! Indentation-aware tokenizer for strategy scripts.
//!
//! Produces `Newline`, `Indent` and `Dedent` tokens the way the
//! recursive-descent parser expects them: newlines inside brackets are
//! ignored, blank and comment-only lines produce nothing, and the stream
//! always ends with a `Newline` (if any token precedes it), the pending
//! dedents and `EndMarker`.

use crate::SyntaxError;
use std::fmt;

/// Maximum bracket nesting (denial-of-service protection).
pub const MAX_BRACKET_DEPTH: usize = 100;

/// Operators and delimiters, longest first so that greedy matching works.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", "<<", ">>", "<=", ">=", "==", "!=",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

const STRING_PREFIXES: &[&str] = &["r", "u", "f", "b", "br", "rb", "fr", "rf"];

/// Token category and payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword
    Name(String),
    /// Numeric literal
    Number(f64),
    /// String literal. For f-strings `value` is the raw body.
    Str {
        /// Decoded (or raw, for f-strings) contents
        value: String,
        /// `f` prefix present
        fstring: bool,
    },
    /// Operator or delimiter
    Op(&'static str),
    /// End of a logical line
    Newline,
    /// Indentation increased
    Indent,
    /// Indentation decreased
    Dedent,
    /// End of input
    EndMarker,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Number(n) => write!(f, "number {n}"),
            Self::Str { .. } => f.write_str("string literal"),
            Self::Op(op) => write!(f, "'{op}'"),
            Self::Newline => f.write_str("end of line"),
            Self::Indent => f.write_str("indent"),
            Self::Dedent => f.write_str("dedent"),
            Self::EndMarker => f.write_str("end of input"),
        }
    }
}

/// A token with its 1-based source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Category and payload
    pub kind: TokenKind,
    /// Line of the first character
    pub line: usize,
    /// Column of the first character
    pub column: usize,
}

/// Splits source text into tokens.
///
/// # Errors
///
/// Returns [`SyntaxError`] for unterminated strings, inconsistent dedents,
/// unbalanced brackets and characters outside the grammar.
///
/// # Examples
///
/// ```
/// use stratguard_script::lexer::{tokenize, TokenKind};
///
/// let tokens = tokenize("if x:\n    y = 1\n").unwrap();
/// assert!(tokens.iter().any(|t| t.kind == TokenKind::Indent));
/// assert_eq!(tokens.last().unwrap().kind, TokenKind::EndMarker);
/// ```
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    indents: Vec<usize>,
    depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            indents: vec![0],
            depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line, self.column)
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.line_start()? {
                    break;
                }
                continue;
            }
            let Some(c) = self.peek() else { break };
            let (line, column) = (self.line, self.column);
            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\n' => {
                    self.bump();
                    if self.depth == 0 {
                        self.push(TokenKind::Newline, line, column);
                        self.at_line_start = true;
                    }
                }
                '\\' => self.continuation()?,
                c if is_ident_start(c) => self.name_or_prefixed_string(line, column)?,
                c if c.is_ascii_digit() => self.number(line, column)?,
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                    self.number(line, column)?;
                }
                '\'' | '"' => self.string("", line, column)?,
                _ => self.operator(line, column)?,
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected end of input inside brackets"));
        }
        let needs_newline = self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Dedent));
        if needs_newline {
            self.push(TokenKind::Newline, self.line, self.column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, self.line, self.column);
        }
        self.push(TokenKind::EndMarker, self.line, self.column);
        Ok(self.tokens)
    }

    /// Measures indentation of a new logical line. Returns `false` at end of
    /// input.
    fn line_start(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.bump();
        }
        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            Some('\n' | '\r') => {
                self.bump();
                return Ok(true);
            }
            Some(_) => {}
        }

        let (line, column) = (self.line, self.column);
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, line, column);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(TokenKind::Dedent, line, column);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    line,
                    column,
                ));
            }
        }
        self.at_line_start = false;
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn continuation(&mut self) -> Result<(), SyntaxError> {
        self.bump();
        if self.peek() == Some('\r') {
            self.bump();
        }
        if self.peek() == Some('\n') {
            self.bump();
            Ok(())
        } else {
            Err(self.error("unexpected character after line continuation"))
        }
    }

    fn name_or_prefixed_string(&mut self, line: usize, column: usize) -> Result<(), SyntaxError> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        let ident: String = self.chars[start..self.pos].iter().collect();
        let lowered = ident.to_ascii_lowercase();
        if matches!(self.peek(), Some('\'' | '"')) && STRING_PREFIXES.contains(&lowered.as_str()) {
            return self.string(&lowered, line, column);
        }
        self.push(TokenKind::Name(ident), line, column);
        Ok(())
    }

    fn number(&mut self, line: usize, column: usize) -> Result<(), SyntaxError> {
        if self.peek() == Some('0')
            && let Some(radix) = self.peek_at(1).and_then(radix_of)
        {
            self.bump();
            self.bump();
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.bump();
            }
            let digits: String = self.chars[start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = u64::from_str_radix(&digits, radix)
                .map_err(|_| SyntaxError::new("invalid integer literal", line, column))?;
            self.push(TokenKind::Number(value as f64), line, column);
            return Ok(());
        }

        let start = self.pos;
        self.digits();
        if self.peek() == Some('.') {
            self.bump();
            self.digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..=sign {
                    self.bump();
                }
                self.digits();
            }
        }
        if matches!(self.peek(), Some('j' | 'J')) {
            return Err(SyntaxError::new(
                "complex literals are not supported",
                line,
                column,
            ));
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let value = text
            .parse::<f64>()
            .map_err(|_| SyntaxError::new(format!("invalid number '{text}'"), line, column))?;
        self.push(TokenKind::Number(value), line, column);
        Ok(())
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.bump();
        }
    }

    fn string(&mut self, prefix: &str, line: usize, column: usize) -> Result<(), SyntaxError> {
        let raw = prefix.contains('r');
        let fstring = prefix.contains('f');
        let Some(quote) = self.bump() else {
            return Err(self.error("expected string"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(SyntaxError::new("unterminated string literal", line, column));
            };
            match c {
                '\\' => {
                    let Some(next) = self.bump() else {
                        return Err(SyntaxError::new("unterminated string literal", line, column));
                    };
                    if raw || fstring {
                        value.push('\\');
                        value.push(next);
                    } else {
                        self.escape(next, &mut value);
                    }
                }
                '\n' if !triple => {
                    return Err(SyntaxError::new("unterminated string literal", line, column));
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    }
                    value.push(c);
                }
                c => value.push(c),
            }
        }
        self.push(TokenKind::Str { value, fstring }, line, column);
        Ok(())
    }

    fn escape(&mut self, c: char, out: &mut String) {
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\n' => {}
            '\\' | '\'' | '"' => out.push(c),
            'x' | 'u' | 'U' => {
                let len = match c {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..len).filter_map(|i| self.peek_at(i)).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if hex.len() == len => {
                        for _ in 0..len {
                            self.bump();
                        }
                        out.push(decoded);
                    }
                    _ => {
                        out.push('\\');
                        out.push(c);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    fn operator(&mut self, line: usize, column: usize) -> Result<(), SyntaxError> {
        let op = OPERATORS
            .iter()
            .find(|op| {
                op.chars()
                    .enumerate()
                    .all(|(i, ch)| self.peek_at(i) == Some(ch))
            })
            .copied()
            .ok_or_else(|| {
                let c = self.peek().unwrap_or(' ');
                SyntaxError::new(format!("unexpected character {c:?}"), line, column)
            })?;
        for _ in 0..op.chars().count() {
            self.bump();
        }
        match op {
            "(" | "[" | "{" => {
                self.depth += 1;
                if self.depth > MAX_BRACKET_DEPTH {
                    return Err(SyntaxError::new("brackets nested too deeply", line, column));
                }
            }
            ")" | "]" | "}" => {
                if self.depth == 0 {
                    return Err(SyntaxError::new(format!("unmatched '{op}'"), line, column));
                }
                self.depth -= 1;
            }
            _ => {}
        }
        self.push(TokenKind::Op(op), line, column);
        Ok(())
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

const fn radix_of(c: char) -> Option<u32> {
    match c {
        'x' | 'X' => Some(16),
        'o' | 'O' => Some(8),
        'b' | 'B' => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    fn name(s: &str) -> TokenKind {
        TokenKind::Name(s.to_string())
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            kinds("x = 1.5\n"),
            vec![
                name("x"),
                TokenKind::Op("="),
                TokenKind::Number(1.5),
                TokenKind::Newline,
                TokenKind::EndMarker
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let k = kinds("if a:\n  b\nc\n");
        assert_eq!(
            k,
            vec![
                name("if"),
                name("a"),
                TokenKind::Op(":"),
                TokenKind::Newline,
                TokenKind::Indent,
                name("b"),
                TokenKind::Newline,
                TokenKind::Dedent,
                name("c"),
                TokenKind::Newline,
                TokenKind::EndMarker
            ]
        );
    }

    #[test]
    fn test_dedents_flushed_at_eof_without_newline() {
        let k = kinds("def f():\n    return 1");
        let tail: Vec<_> = k.iter().rev().take(3).cloned().collect();
        assert_eq!(
            tail,
            vec![TokenKind::EndMarker, TokenKind::Dedent, TokenKind::Newline]
        );
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let k = kinds("a\n\n   # note\n\nb\n");
        assert_eq!(
            k,
            vec![
                name("a"),
                TokenKind::Newline,
                name("b"),
                TokenKind::Newline,
                TokenKind::EndMarker
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_ignored() {
        let k = kinds("f(1,\n  2)\n");
        assert!(!k[..k.len() - 2].contains(&TokenKind::Newline));
        assert!(!k.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_inconsistent_dedent() {
        let err = tokenize("if a:\n    b\n  c\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn test_string_forms() {
        let k = kinds("a = 'x\\n'\nb = r'\\d'\nc = \"\"\"multi\nline\"\"\"\n");
        assert!(k.contains(&TokenKind::Str {
            value: "x\n".to_string(),
            fstring: false
        }));
        assert!(k.contains(&TokenKind::Str {
            value: "\\d".to_string(),
            fstring: false
        }));
        assert!(k.contains(&TokenKind::Str {
            value: "multi\nline".to_string(),
            fstring: false
        }));
    }

    #[test]
    fn test_fstring_kept_raw() {
        let k = kinds("f'{a}'\n");
        assert_eq!(
            k[0],
            TokenKind::Str {
                value: "{a}".to_string(),
                fstring: true
            }
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("x = 'abc\n").is_err());
        assert!(tokenize("x = \"\"\"abc").is_err());
    }

    #[test]
    fn test_numbers() {
        let k = kinds("0x1F 1_000 .5 2e3 3.\n");
        assert_eq!(
            &k[..5],
            &[
                TokenKind::Number(31.0),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.5),
                TokenKind::Number(2000.0),
                TokenKind::Number(3.0)
            ]
        );
    }

    #[test]
    fn test_greedy_operators() {
        let k = kinds("a **= b // c -> d\n");
        assert!(k.contains(&TokenKind::Op("**=")));
        assert!(k.contains(&TokenKind::Op("//")));
        assert!(k.contains(&TokenKind::Op("->")));
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(tokenize("f(1\n").is_err());
        assert!(tokenize("x)\n").is_err());
    }

    #[test]
    fn test_bracket_depth_limit() {
        let deep = "(".repeat(MAX_BRACKET_DEPTH + 1);
        let err = tokenize(&deep).unwrap_err();
        assert!(err.message.contains("nested"));
    }

    #[test]
    fn test_line_continuation() {
        let k = kinds("x = 1 + \\\n  2\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn test_positions_are_one_based() {
        let err = tokenize("a\n$\n").unwrap_err();
        assert_eq!((err.line, err.column), (2, 1));
        let tokens = tokenize("ab = 1\n").unwrap();
        assert_eq!((tokens[1].line, tokens[1].column), (1, 4));
    }
}
