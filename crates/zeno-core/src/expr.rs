//! Value resolution and simple expressions.
//!
//! A value is a literal, a `$a.b.0.c` path through the scope chain, or a
//! whitespace-separated expression such as `$count + 1` or
//! `$role == admin && $active`. A string is treated as an expression only
//! when every other token is an operator and at least one operand is a
//! variable or a typed literal; anything else stays a literal string.

use std::cmp::Ordering;

use zeno_common::RuntimeError;

use crate::scope::Scope;
use crate::value::Value;

/// Infix operator of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "||" => Self::Or,
            "&&" => Self::And,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            _ => return None,
        })
    }

    pub fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div | Self::Rem => 5,
        }
    }

    /// Apply the operator to two evaluated operands.
    ///
    /// # Errors
    ///
    /// Fails on incompatible operand types and division by zero.
    pub fn apply(self, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
        let ordered = |pred: fn(Ordering) -> bool| {
            Value::Bool(lhs.compare(rhs).is_some_and(pred))
        };
        Ok(match self {
            Self::Or => Value::Bool(lhs.is_truthy() || rhs.is_truthy()),
            Self::And => Value::Bool(lhs.is_truthy() && rhs.is_truthy()),
            Self::Eq => Value::Bool(lhs.loose_eq(rhs)),
            Self::Ne => Value::Bool(!lhs.loose_eq(rhs)),
            Self::Lt => ordered(Ordering::is_lt),
            Self::Le => ordered(Ordering::is_le),
            Self::Gt => ordered(Ordering::is_gt),
            Self::Ge => ordered(Ordering::is_ge),
            Self::Add => lhs.add(rhs)?,
            Self::Sub => lhs.sub(rhs)?,
            Self::Mul => lhs.mul(rhs)?,
            Self::Div => lhs.div(rhs)?,
            Self::Rem => lhs.rem(rhs)?,
        })
    }
}

/// A leaf of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `$a.b.0` without the `$`.
    Path(String),
    Literal(Value),
    Not(Box<Operand>),
}

impl Operand {
    fn parse(token: &str) -> Self {
        if let Some(inner) = token.strip_prefix('!') {
            if !inner.is_empty() {
                return Self::Not(Box::new(Self::parse(inner)));
            }
        }
        if let Some(path) = token.strip_prefix('$') {
            return Self::Path(path.to_string());
        }
        if is_quoted(token) {
            return Self::Literal(Value::String(token[1..token.len() - 1].to_string()));
        }
        Self::Literal(match token {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "nil" | "null" => Value::Nil,
            _ => token
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| token.parse::<f64>().map(Value::Float))
                .unwrap_or_else(|_| Value::String(token.to_string())),
        })
    }

    fn eval(&self, scope: &Scope) -> Value {
        match self {
            Self::Path(path) => scope.resolve_path(path),
            Self::Literal(value) => value.clone(),
            Self::Not(inner) => Value::Bool(!inner.eval(scope).is_truthy()),
        }
    }
}

/// Parsed expression tree; both the interpreter and the bytecode compiler
/// consume it.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Operand(Operand),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate against `scope`.
    ///
    /// # Errors
    ///
    /// Propagates operator failures.
    pub fn eval(&self, scope: &Scope) -> Result<Value, RuntimeError> {
        match self {
            Self::Operand(operand) => Ok(operand.eval(scope)),
            Self::Binary(op, lhs, rhs) => op.apply(&lhs.eval(scope)?, &rhs.eval(scope)?),
        }
    }
}

/// Resolve a value against `scope`, recursing into lists and maps.
///
/// # Errors
///
/// Fails when an expression applies an operator to incompatible operands.
pub fn resolve(value: &Value, scope: &Scope) -> Result<Value, RuntimeError> {
    match value {
        Value::String(s) => match parse(s) {
            Some(expr) => expr.eval(scope),
            None => Ok(value.clone()),
        },
        Value::List(items) => items
            .iter()
            .map(|v| resolve(v, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve(v, scope)?)))
            .collect::<Result<_, RuntimeError>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

/// Evaluate `source` as an expression; `None` when it is not shaped like one.
pub fn evaluate(source: &str, scope: &Scope) -> Option<Result<Value, RuntimeError>> {
    parse(source).map(|expr| expr.eval(scope))
}

/// Parse a string value; `None` means it is a literal string.
pub fn parse(source: &str) -> Option<Expr> {
    let trimmed = source.trim();
    if let Some(path) = trimmed.strip_prefix('$') {
        if !path.is_empty() && !trimmed.contains(char::is_whitespace) {
            return Some(Expr::Operand(Operand::Path(path.to_string())));
        }
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    match tokens.as_slice() {
        [] => None,
        [single] => {
            let inner = single.strip_prefix('!')?;
            is_strong(inner).then(|| Expr::Operand(Operand::parse(single)))
        }
        ["!", inner] => is_strong(inner)
            .then(|| Expr::Operand(Operand::Not(Box::new(Operand::parse(inner))))),
        tokens if tokens.len() % 2 == 1 => {
            let mut ops = Vec::with_capacity(tokens.len() / 2);
            let mut operands = Vec::with_capacity(tokens.len() / 2 + 1);
            let mut strong = false;
            for (i, token) in tokens.iter().enumerate() {
                if i % 2 == 1 {
                    ops.push(BinOp::parse(token)?);
                } else {
                    if BinOp::parse(token).is_some() {
                        return None;
                    }
                    strong |= is_strong(token.strip_prefix('!').unwrap_or(*token));
                    operands.push(Expr::Operand(Operand::parse(token)));
                }
            }
            strong.then(|| build(operands, &ops))
        }
        _ => None,
    }
}

/// Fold operands into a tree by precedence (left associative).
fn build(operands: Vec<Expr>, ops: &[BinOp]) -> Expr {
    let mut output: Vec<Expr> = Vec::with_capacity(operands.len());
    let mut pending: Vec<BinOp> = Vec::with_capacity(ops.len());
    let mut operands = operands.into_iter();

    let collapse = |output: &mut Vec<Expr>, op: BinOp| {
        let rhs = output.pop().unwrap_or(Expr::Operand(Operand::Literal(Value::Nil)));
        let lhs = output.pop().unwrap_or(Expr::Operand(Operand::Literal(Value::Nil)));
        output.push(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
    };

    output.extend(operands.next());
    for (op, operand) in ops.iter().zip(operands) {
        while let Some(top) = pending.last().copied() {
            if top.precedence() < op.precedence() {
                break;
            }
            pending.pop();
            collapse(&mut output, top);
        }
        pending.push(*op);
        output.push(operand);
    }
    while let Some(op) = pending.pop() {
        collapse(&mut output, op);
    }
    output
        .pop()
        .unwrap_or(Expr::Operand(Operand::Literal(Value::Nil)))
}

/// Variables and typed literals mark a string as an expression.
fn is_strong(token: &str) -> bool {
    token.starts_with('$')
        || is_quoted(token)
        || matches!(token, "true" | "false" | "nil" | "null")
        || token.parse::<f64>().is_ok()
}

fn is_quoted(token: &str) -> bool {
    token.len() >= 2
        && ((token.starts_with('"') && token.ends_with('"'))
            || (token.starts_with('\'') && token.ends_with('\'')))
}
