// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Constrained breakpoint expression language.
//!
//! Pure predicates over `(event, state)`: equality, ordering, boolean
//! connectives, dotted field access and string `contains`. There is no
//! I/O, no iteration, and no user-defined identifiers — the only path
//! roots are `event` and `state`, checked at compile time.
//!
//! ```text
//! expr       := or
//! or         := and ( '||' and )*
//! and        := unary ( '&&' unary )*
//! unary      := '!' unary | comparison
//! comparison := operand ( cmp_op operand )?
//! cmp_op     := '==' | '!=' | '<' | '<=' | '>' | '>=' | 'contains'
//! operand    := path | literal | '(' expr ')'
//! path       := ( 'event' | 'state' ) ( '.' ident )*
//! literal    := string | number | 'true' | 'false' | 'null'
//! ```

use serde_json::Value;
use thiserror::Error;

/// Compile- and eval-time errors for breakpoint expressions.
#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("lex error at byte {0}: {1}")]
    Lex(usize, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown identifier '{0}' (only 'event' and 'state' are allowed)")]
    UnknownIdentifier(String),
    #[error("cannot order values of this type (path resolved to {0})")]
    Unorderable(&'static str),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Root of a dotted access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    Event,
    State,
}

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(PathRoot, Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Whether the expression reads from `state` anywhere.
    pub fn references_state(&self) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Path(root, _) => *root == PathRoot::State,
            Expr::Not(inner) => inner.references_state(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(a, _, b) | Expr::Contains(a, b) => {
                a.references_state() || b.references_state()
            }
        }
    }

    /// Evaluate against JSON views of the event and state.
    pub fn eval(&self, event: &Value, state: &Value) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval_value(event, state)?))
    }

    fn eval_value(&self, event: &Value, state: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(root, segments) => {
                let mut current = match root {
                    PathRoot::Event => event,
                    PathRoot::State => state,
                };
                for segment in segments {
                    current = match current.get(segment) {
                        Some(next) => next,
                        None => return Ok(Value::Null),
                    };
                }
                Ok(current.clone())
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval_value(event, state)?))),
            Expr::And(a, b) => Ok(Value::Bool(
                truthy(&a.eval_value(event, state)?) && truthy(&b.eval_value(event, state)?),
            )),
            Expr::Or(a, b) => Ok(Value::Bool(
                truthy(&a.eval_value(event, state)?) || truthy(&b.eval_value(event, state)?),
            )),
            Expr::Cmp(a, op, b) => {
                let left = a.eval_value(event, state)?;
                let right = b.eval_value(event, state)?;
                compare(&left, *op, &right).map(Value::Bool)
            }
            Expr::Contains(a, b) => {
                let haystack = a.eval_value(event, state)?;
                let needle = b.eval_value(event, state)?;
                Ok(Value::Bool(match (&haystack, &needle) {
                    (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
                    (Value::Array(items), needle) => items.contains(needle),
                    _ => false,
                }))
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => Ok(json_eq(left, right)),
        CmpOp::Ne => Ok(!json_eq(left, right)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                // Absent fields compare false rather than erroring.
                _ if left.is_null() || right.is_null() => return Ok(false),
                _ => {
                    return Err(ExprError::Unorderable(type_name(if left.as_f64().is_none() {
                        left
                    } else {
                        right
                    })))
                }
            };
            Ok(match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                _ => a >= b,
            })
        }
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    // Numbers compare numerically so 1 == 1.0.
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- lexer ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Dot,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::Lex(i, "single '=' (use '==')".to_string()));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::Lex(i, "single '&' (use '&&')".to_string()));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::Lex(i, "single '|' (use '||')".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = bytes[i];
                let start = i;
                i += 1;
                let mut out = String::new();
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ExprError::Lex(start, "unterminated string".to_string()))
                        }
                        Some(&b) if b == quote => {
                            i += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            match bytes.get(i + 1) {
                                Some(&b) if b == quote || b == b'\\' => {
                                    out.push(b as char);
                                    i += 2;
                                }
                                _ => {
                                    return Err(ExprError::Lex(
                                        i,
                                        "bad escape in string".to_string(),
                                    ))
                                }
                            }
                        }
                        Some(&b) => {
                            out.push(b as char);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'e'
                        || bytes[i] == b'E' || bytes[i] == b'+'
                        || (bytes[i] == b'-' && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                let text = &src[start..i];
                let num: f64 = text
                    .parse()
                    .map_err(|_| ExprError::Lex(start, format!("bad number '{text}'")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(src[start..i].to_string()));
            }
            other => {
                return Err(ExprError::Lex(i, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// --- parser ---------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t == *token => Ok(()),
            other => Err(ExprError::Parse(format!("expected {what}, got {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::NotEq) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Ident(name)) if name == "contains" => {
                self.pos += 1;
                let right = self.parse_operand()?;
                return Ok(Expr::Contains(Box::new(left), Box::new(right)));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "event" => self.parse_path(PathRoot::Event),
                "state" => self.parse_path(PathRoot::State),
                other => Err(ExprError::UnknownIdentifier(other.to_string())),
            },
            other => Err(ExprError::Parse(format!("expected operand, got {other:?}"))),
        }
    }

    fn parse_path(&mut self, root: PathRoot) -> Result<Expr, ExprError> {
        let mut segments = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.next() {
                Some(Token::Ident(segment)) => segments.push(segment),
                other => {
                    return Err(ExprError::Parse(format!(
                        "expected field name after '.', got {other:?}"
                    )))
                }
            }
        }
        Ok(Expr::Path(root, segments))
    }
}

/// Compile an expression source string.
pub fn compile(src: &str) -> Result<Expr, ExprError> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return Err(ExprError::Parse("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

/// Resolve a dotted path (for breakpoint data collection) against a root.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> &'a Value {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

#[cfg(test)]
#[path = "expr_tests.rs"]
mod tests;
