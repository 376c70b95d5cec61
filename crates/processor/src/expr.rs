//! Sandboxed expression language
//!
//! Filters, computed fields, alert conditions and custom triggers are written
//! in a small declarative language instead of executable code:
//!
//! ```text
//! amount > 100 and (country == "DE" or country in ["AT", "CH"])
//! price * quantity - discount
//! not exists(user.email) || starts_with(lower(user.email), "test")
//! ```
//!
//! Expressions are parsed once when a stream is validated. Evaluation is a
//! pure walk over the syntax tree with no side effects, no loops and a fixed
//! whitelist of functions.

use logos::Logos;
use serde_json::{Map, Number, Value};
use std::fmt;
use stream_analytics_types::Event;
use thiserror::Error;

/// Maximum accepted source length in bytes
pub const MAX_SOURCE_LEN: usize = 4096;

/// Maximum nesting depth of the syntax tree
pub const MAX_DEPTH: usize = 64;

/// Expression parse and evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("expression is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("invalid token '{text}' at offset {position}")]
    InvalidToken { text: String, position: usize },

    #[error("unexpected {found} at offset {position}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        position: usize,
    },

    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd { expected: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("expression nesting exceeds depth {0}")]
    TooDeep(usize),

    #[error("type error: {0}")]
    Type(String),
}

pub type ExprResult<T> = std::result::Result<T, ExprError>;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
enum Token {
    #[token("and")]
    #[token("&&")]
    And,
    #[token("or")]
    #[token("||")]
    Or,
    #[token("not")]
    #[token("!")]
    Not,
    #[token("in")]
    In,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z0-9_]+)*", |lex| Some(lex.slice().to_string()))]
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => write!(f, "'and'"),
            Token::Or => write!(f, "'or'"),
            Token::Not => write!(f, "'not'"),
            Token::In => write!(f, "'in'"),
            Token::True => write!(f, "'true'"),
            Token::False => write!(f, "'false'"),
            Token::Null => write!(f, "'null'"),
            Token::EqEq => write!(f, "'=='"),
            Token::NotEq => write!(f, "'!='"),
            Token::Lt => write!(f, "'<'"),
            Token::Le => write!(f, "'<='"),
            Token::Gt => write!(f, "'>'"),
            Token::Ge => write!(f, "'>='"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Ident(s) => write!(f, "identifier '{}'", s),
        }
    }
}

fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            other => out.push(other),
        }
    }
    Some(out)
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Whitelisted functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Exists,
    Len,
    Lower,
    Upper,
    Abs,
    Round,
    Contains,
    StartsWith,
    EndsWith,
    Coalesce,
    ToNumber,
    ToString,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exists" => Self::Exists,
            "len" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "coalesce" => Self::Coalesce,
            "to_number" => Self::ToNumber,
            "to_string" => Self::ToString,
            _ => return None,
        })
    }

    /// Accepted argument counts (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Contains | Self::StartsWith | Self::EndsWith => (2, 2),
            Self::Round => (1, 2),
            Self::Coalesce => (1, usize::MAX),
            _ => (1, 1),
        }
    }
}

/// Syntax tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Vec<Expr>),
    Call(Function, Vec<Expr>),
}

/// Source of field values during evaluation
pub trait FieldResolver {
    fn resolve(&self, path: &str) -> Option<Value>;
}

impl FieldResolver for Event {
    fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.field(path) {
            return Some(value.clone());
        }
        match path {
            "event_time" => Some(Value::from(self.event_time_ms())),
            "ingest_time" => Some(Value::from(self.ingest_time.timestamp_millis())),
            _ => None,
        }
    }
}

impl FieldResolver for Map<String, Value> {
    fn resolve(&self, path: &str) -> Option<Value> {
        stream_analytics_types::events::lookup(self, path).cloned()
    }
}

/// A parsed, validated expression
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    root: Expr,
}

impl CompiledExpr {
    /// Parse an expression
    pub fn parse(source: &str) -> ExprResult<Self> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(ExprError::TooLong {
                len: source.len(),
                max: MAX_SOURCE_LEN,
            });
        }

        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_expr()?;
        if let Some((token, position)) = parser.peek_spanned() {
            return Err(ExprError::UnexpectedToken {
                found: token.to_string(),
                expected: "end of expression".to_string(),
                position,
            });
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against a field resolver
    pub fn evaluate(&self, ctx: &dyn FieldResolver) -> ExprResult<Value> {
        eval(&self.root, ctx)
    }

    /// Evaluate as a condition; `null` counts as false, non-boolean results are errors
    pub fn evaluate_condition(&self, ctx: &dyn FieldResolver) -> ExprResult<bool> {
        match self.evaluate(ctx)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ExprError::Type(format!(
                "condition evaluated to {} instead of a boolean",
                type_name(&other)
            ))),
        }
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn tokenize(source: &str) -> ExprResult<Vec<(Token, usize)>> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span().start)),
            Err(()) => {
                return Err(ExprError::InvalidToken {
                    text: lexer.slice().to_string(),
                    position: lexer.span().start,
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_spanned(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(t, p)| (t, *p))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> ExprResult<()> {
        match self.peek_spanned() {
            Some((token, _)) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            Some((token, position)) => Err(ExprError::UnexpectedToken {
                found: token.to_string(),
                expected: expected.to_string(),
                position,
            }),
            None => Err(ExprError::UnexpectedEnd {
                expected: expected.to_string(),
            }),
        }
    }

    fn enter(&mut self) -> ExprResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> ExprResult<Expr> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_not();
            self.leave();
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ExprResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::In) => {
                self.pos += 1;
                self.expect(Token::LBracket)?;
                let items = self.parse_list(Token::RBracket)?;
                return Ok(Expr::In(Box::new(left), items));
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.parse_unary();
            self.leave();
            return Ok(Expr::Neg(Box::new(inner?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ExprResult<Expr> {
        let position = self.peek_spanned().map(|(_, p)| p).unwrap_or(0);
        let Some(token) = self.advance() else {
            return Err(ExprError::UnexpectedEnd {
                expected: "a value".to_string(),
            });
        };

        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let function = Function::lookup(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    let args = self.parse_list(Token::RParen)?;
                    let (min, max) = function.arity();
                    if args.len() < min || args.len() > max {
                        let expected = if min == max {
                            min.to_string()
                        } else if max == usize::MAX {
                            format!("at least {}", min)
                        } else {
                            format!("{} to {}", min, max)
                        };
                        return Err(ExprError::Arity {
                            name,
                            expected,
                            actual: args.len(),
                        });
                    }
                    Ok(Expr::Call(function, args))
                } else {
                    Ok(Expr::Field(name))
                }
            }
            other => Err(ExprError::UnexpectedToken {
                found: other.to_string(),
                expected: "a value".to_string(),
                position,
            }),
        }
    }

    /// Comma separated expressions up to `close`; the opening delimiter is already consumed
    fn parse_list(&mut self, close: Token) -> ExprResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }
}

fn eval(expr: &Expr, ctx: &dyn FieldResolver) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(path) => Ok(ctx.resolve(path).unwrap_or(Value::Null)),
        Expr::Neg(inner) => match eval(inner, ctx)? {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => Ok(number(-n.as_f64().unwrap_or(0.0))),
            other => Err(ExprError::Type(format!(
                "cannot negate {}",
                type_name(&other)
            ))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, ctx)?))),
        Expr::Binary(BinaryOp::And, l, r) => {
            if !truthy(&eval(l, ctx)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, ctx)?)))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if truthy(&eval(l, ctx)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, ctx)?)))
        }
        Expr::Binary(op, l, r) => {
            let left = eval(l, ctx)?;
            let right = eval(r, ctx)?;
            binary(*op, &left, &right)
        }
        Expr::In(needle, items) => {
            let needle = eval(needle, ctx)?;
            for item in items {
                if values_equal(&needle, &eval(item, ctx)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Call(function, args) => call(*function, args, ctx),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> ExprResult<Value> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right);
            let result = match (op, ordering) {
                (_, None) => false,
                (BinaryOp::Lt, Some(o)) => o.is_lt(),
                (BinaryOp::Le, Some(o)) => o.is_le(),
                (BinaryOp::Gt, Some(o)) => o.is_gt(),
                (BinaryOp::Ge, Some(o)) => o.is_ge(),
                _ => false,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Ok(Value::String(format!("{}{}", a, b)));
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(ExprError::Type(format!(
            "cannot apply {:?} to {} and {}",
            op,
            type_name(left),
            type_name(right)
        )));
    };

    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Ok(Value::Null),
        BinaryOp::Div => a / b,
        BinaryOp::Rem if b == 0.0 => return Ok(Value::Null),
        BinaryOp::Rem => a % b,
        _ => unreachable!("comparison and logical operators handled above"),
    };
    Ok(number(result))
}

fn call(function: Function, args: &[Expr], ctx: &dyn FieldResolver) -> ExprResult<Value> {
    if function == Function::Coalesce {
        for arg in args {
            let value = eval(arg, ctx)?;
            if !value.is_null() {
                return Ok(value);
            }
        }
        return Ok(Value::Null);
    }

    let values = args
        .iter()
        .map(|a| eval(a, ctx))
        .collect::<ExprResult<Vec<_>>>()?;
    let first = &values[0];

    let result = match function {
        Function::Exists => Value::Bool(!first.is_null()),
        Function::Len => match first {
            Value::String(s) => Value::from(s.chars().count() as u64),
            Value::Array(a) => Value::from(a.len() as u64),
            Value::Object(o) => Value::from(o.len() as u64),
            _ => Value::Null,
        },
        Function::Lower => first
            .as_str()
            .map(|s| Value::String(s.to_lowercase()))
            .unwrap_or(Value::Null),
        Function::Upper => first
            .as_str()
            .map(|s| Value::String(s.to_uppercase()))
            .unwrap_or(Value::Null),
        Function::Abs => first.as_f64().map(|n| number(n.abs())).unwrap_or(Value::Null),
        Function::Round => {
            let digits = values.get(1).and_then(Value::as_f64).unwrap_or(0.0) as i32;
            let factor = 10f64.powi(digits);
            first
                .as_f64()
                .map(|n| number((n * factor).round() / factor))
                .unwrap_or(Value::Null)
        }
        Function::Contains => match (first, &values[1]) {
            (Value::String(s), Value::String(sub)) => Value::Bool(s.contains(sub.as_str())),
            (Value::Array(items), needle) => {
                Value::Bool(items.iter().any(|item| values_equal(item, needle)))
            }
            (Value::Null, _) => Value::Null,
            _ => Value::Bool(false),
        },
        Function::StartsWith => match (first, &values[1]) {
            (Value::String(s), Value::String(p)) => Value::Bool(s.starts_with(p.as_str())),
            (Value::Null, _) => Value::Null,
            _ => Value::Bool(false),
        },
        Function::EndsWith => match (first, &values[1]) {
            (Value::String(s), Value::String(p)) => Value::Bool(s.ends_with(p.as_str())),
            (Value::Null, _) => Value::Null,
            _ => Value::Bool(false),
        },
        Function::ToNumber => to_number(first).map(number).unwrap_or(Value::Null),
        Function::ToString => match first {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        Function::Coalesce => Value::Null,
    };
    Ok(result)
}

/// Truthiness used by boolean operators
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Structural equality with numeric comparison across integer and float encodings
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Numeric view of a value, parsing numeric strings
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Encode an f64, keeping integral values as JSON integers
pub fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
