//! Guard expression evaluation for JSON contexts.
//!
//! Guards loaded from machine definitions are boolean expressions over the
//! execution context and the payload of the event being dispatched:
//!
//! - `ctx.field`, `event.field` - truthy check, nested paths allowed
//! - `== != > >= < <=` - comparisons against a literal
//! - `!expr`, `expr && expr`, `expr || expr` (AND binds tighter)
//! - `(expr)` - grouping
//!
//! Examples:
//! - `ctx.retries < 3 && !ctx.cancelled`
//! - `event.amount >= 100 || ctx.vip`
//! - `ctx.mode == "auto"`

use crate::error::ModelError;
use serde_json::Value;
use std::fmt;

/// Root a guard path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    Context,
    Event,
}

/// A dotted path such as `ctx.order.total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: PathRoot,
    pub field: String,
}

impl FieldPath {
    fn resolve<'a>(&self, ctx: &'a Value, payload: &'a Value) -> &'a Value {
        let mut current = match self.root {
            PathRoot::Context => ctx,
            PathRoot::Event => payload,
        };
        for part in self.field.split('.') {
            current = match current {
                Value::Object(map) => map.get(part).unwrap_or(&Value::Null),
                _ => &Value::Null,
            };
        }
        current
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.root {
            PathRoot::Context => "ctx",
            PathRoot::Event => "event",
        };
        write!(f, "{}.{}", prefix, self.field)
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    Truthy(FieldPath),
    Eq(FieldPath, Value),
    Ne(FieldPath, Value),
    Gt(FieldPath, f64),
    Ge(FieldPath, f64),
    Lt(FieldPath, f64),
    Le(FieldPath, f64),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(invalid(format!(
                "unexpected input at {}: '{}'",
                parser.pos,
                &parser.input[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Evaluates the guard against a context and an event payload.
    pub fn evaluate(&self, ctx: &Value, payload: &Value) -> bool {
        match self {
            GuardExpr::Truthy(path) => is_truthy(path.resolve(ctx, payload)),
            GuardExpr::Eq(path, expected) => values_equal(path.resolve(ctx, payload), expected),
            GuardExpr::Ne(path, expected) => !values_equal(path.resolve(ctx, payload), expected),
            GuardExpr::Gt(path, n) => compare(path.resolve(ctx, payload), |v| v > *n),
            GuardExpr::Ge(path, n) => compare(path.resolve(ctx, payload), |v| v >= *n),
            GuardExpr::Lt(path, n) => compare(path.resolve(ctx, payload), |v| v < *n),
            GuardExpr::Le(path, n) => compare(path.resolve(ctx, payload), |v| v <= *n),
            GuardExpr::And(l, r) => l.evaluate(ctx, payload) && r.evaluate(ctx, payload),
            GuardExpr::Or(l, r) => l.evaluate(ctx, payload) || r.evaluate(ctx, payload),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, payload),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ModelError {
    ModelError::InvalidGuard {
        reason: reason.into(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn compare(value: &Value, op: impl Fn(f64) -> bool) -> bool {
    value.as_f64().map(op).unwrap_or(false)
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_or(&mut self) -> Result<GuardExpr, ModelError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();
        while self.eat("||") {
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, ModelError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();
        while self.eat("&&") {
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, ModelError> {
        self.skip_whitespace();
        if self.peek_str("!") && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, ModelError> {
        self.skip_whitespace();
        if self.eat("(") {
            let expr = self.parse_or()?;
            self.skip_whitespace();
            if !self.eat(")") {
                return Err(invalid("expected ')'"));
            }
            return Ok(expr);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, ModelError> {
        let path = self.parse_path()?;
        self.skip_whitespace();

        // Two-character operators first so `>=` is not read as `>`.
        if self.eat("==") {
            return Ok(GuardExpr::Eq(path, self.parse_value()?));
        }
        if self.eat("!=") {
            return Ok(GuardExpr::Ne(path, self.parse_value()?));
        }
        if self.eat(">=") {
            return Ok(GuardExpr::Ge(path, self.parse_number()?));
        }
        if self.eat("<=") {
            return Ok(GuardExpr::Le(path, self.parse_number()?));
        }
        if self.eat(">") {
            return Ok(GuardExpr::Gt(path, self.parse_number()?));
        }
        if self.eat("<") {
            return Ok(GuardExpr::Lt(path, self.parse_number()?));
        }
        Ok(GuardExpr::Truthy(path))
    }

    fn parse_path(&mut self) -> Result<FieldPath, ModelError> {
        self.skip_whitespace();
        let root = if self.eat("ctx.") {
            PathRoot::Context
        } else if self.eat("event.") {
            PathRoot::Event
        } else {
            return Err(invalid("field must start with 'ctx.' or 'event.'"));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let field = &self.input[start..self.pos];
        if field.is_empty() || field.starts_with('.') || field.ends_with('.') {
            return Err(invalid(format!("invalid field name: '{}'", field)));
        }
        Ok(FieldPath {
            root,
            field: field.to_string(),
        })
    }

    fn parse_value(&mut self) -> Result<Value, ModelError> {
        self.skip_whitespace();
        if self.eat("true") {
            return Ok(Value::Bool(true));
        }
        if self.eat("false") {
            return Ok(Value::Bool(false));
        }
        if self.eat("null") {
            return Ok(Value::Null);
        }
        if self.peek_str("\"") {
            return self.parse_string();
        }
        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("invalid number: {}", num)))
    }

    fn parse_string(&mut self) -> Result<Value, ModelError> {
        self.pos += 1;
        let mut out = String::new();
        let mut escaped = false;
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return Ok(Value::String(out));
            } else {
                out.push(c);
            }
        }
        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, ModelError> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", text)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.peek_str(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// Evaluates optional guards.
pub struct GuardEvaluator;

impl GuardEvaluator {
    pub fn evaluate(guard: &GuardExpr, ctx: &Value, payload: &Value) -> bool {
        guard.evaluate(ctx, payload)
    }

    /// `None` always passes.
    pub fn evaluate_opt(guard: Option<&GuardExpr>, ctx: &Value, payload: &Value) -> bool {
        guard.map(|g| g.evaluate(ctx, payload)).unwrap_or(true)
    }
}
