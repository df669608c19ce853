//! Restricted guard expression language for `when` and `while`.
//!
//! Grammar (placeholders are substituted before tokenizing):
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | compare
//! compare := primary (op primary)?
//! op      := "=" | "==" | "!=" | ">" | ">=" | "<" | "<="
//! primary := number | string | true | false | null | "(" expr ")"
//! ```
//!
//! Anything else (identifiers, function calls, arithmetic) is rejected.
//! `True`/`False`/`None` are accepted as aliases of the lowercase literals.

use serde_json::{Number, Value};

use super::placeholder::{Reference, Resolver, find_placeholders};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from parsing or evaluating a guard expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error in '{expr}' at {position}: {message}")]
    Syntax {
        expr: String,
        position: usize,
        message: String,
    },

    #[error("type error in '{expr}': {message}")]
    Type { expr: String, message: String },
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    Op(CompareOp),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let syntax = |position: usize, message: String| ExpressionError::Syntax {
        expr: expr.to_string(),
        position,
        message,
    };

    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('=', _) => (CompareOp::Eq, 1),
                    ('!', Some('=')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('>', _) => (CompareOp::Gt, 1),
                    _ => return Err(syntax(pos, "'!' is not an operator; use 'not'".to_string())),
                };
                tokens.push((pos, Token::Op(op)));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(syntax(pos, "unterminated string literal".to_string()));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(i) else {
                                return Err(syntax(pos, "unterminated string literal".to_string()));
                            };
                            text.push(escaped);
                            i += 1;
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push((pos, Token::Str(text)));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].1.is_ascii_digit() || matches!(chars[i].1, '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(pos, format!("invalid number '{text}'")))?;
                tokens.push((pos, Token::Number(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "null" | "None" => Token::Null,
                    _ => return Err(syntax(pos, format!("unexpected identifier '{word}'"))),
                };
                tokens.push((pos, token));
            }
            other => return Err(syntax(pos, format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expr: self.source.to_string(),
            position: self.position(),
            message: message.into(),
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        let expr = match token {
            Token::Number(n) => Expr::Literal(
                Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| self.error("number is not finite"))?,
            ),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Bool(b) => Expr::Literal(Value::Bool(b)),
            Token::Null => Expr::Literal(Value::Null),
            Token::LParen => {
                self.pos += 1;
                let inner = self.or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                inner
            }
            other => return Err(self.error(format!("unexpected token {other:?}"))),
        };
        self.pos += 1;
        Ok(expr)
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse already-substituted expression text.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        };
        let root = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Evaluate to a boolean.
    pub fn evaluate(&self) -> Result<bool, ExpressionError> {
        self.eval(&self.root).map(|v| truthy(&v))
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::And(l, r) => {
                if !truthy(&self.eval(l)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(r)?)))
            }
            Expr::Or(l, r) => {
                if truthy(&self.eval(l)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(r)?)))
            }
            Expr::Compare(op, l, r) => {
                let (l, r) = (self.eval(l)?, self.eval(r)?);
                self.compare(*op, &l, &r).map(Value::Bool)
            }
        }
    }

    fn compare(&self, op: CompareOp, l: &Value, r: &Value) -> Result<bool, ExpressionError> {
        if matches!(op, CompareOp::Eq | CompareOp::Ne) {
            return Ok(loose_eq(l, r) == (op == CompareOp::Eq));
        }
        let ordering = match (l, r) {
            (Value::Null, _) | (_, Value::Null) => return Ok(false),
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };
        let Some(ordering) = ordering else {
            return Err(ExpressionError::Type {
                expr: self.source.clone(),
                message: format!("cannot order {l} against {r}"),
            });
        };
        Ok(match op {
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Ge => ordering.is_ge(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Le => ordering.is_le(),
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
        })
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

/// Truthiness used by guards and literal `when` values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Render a resolved value as an expression literal.
pub fn to_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Replace every placeholder in `expr` with a literal.
///
/// Placeholders that cannot be resolved yet are replaced by `unresolved`.
pub fn substitute(expr: &str, resolver: &Resolver<'_>, unresolved: &str) -> String {
    substitute_with(expr, |body| {
        Reference::parse(body)
            .ok()
            .and_then(|r| resolver.lookup(&r).ok())
            .map(|v| to_literal(&v))
            .unwrap_or_else(|| unresolved.to_string())
    })
}

/// Replace every placeholder in `expr` with the output of `f`.
pub fn substitute_with(expr: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut cursor = 0;
    for span in find_placeholders(expr) {
        out.push_str(&expr[cursor..span.start]);
        out.push_str(&f(span.body));
        cursor = span.end;
    }
    out.push_str(&expr[cursor..]);
    out
}

/// Substitute, parse and evaluate a guard in one step.
pub fn evaluate_guard(
    expr: &str,
    resolver: &Resolver<'_>,
    unresolved: &str,
) -> Result<bool, ExpressionError> {
    Expression::parse(&substitute(expr, resolver, unresolved))?.evaluate()
}

/// Check guard syntax without resolving anything (every placeholder becomes `0`).
pub fn check_syntax(expr: &str) -> Result<(), ExpressionError> {
    Expression::parse(&substitute_with(expr, |_| "0".to_string())).map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
