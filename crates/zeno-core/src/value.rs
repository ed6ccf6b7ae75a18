//! Dynamically typed values held in scopes and node attributes.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use zeno_common::RuntimeError;

/// Ordered string-keyed map; attribute order is observable by slots.
pub type ValueMap = IndexMap<String, Value>;

/// A scope or attribute value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
    /// Native object owned by a slot (query state, transaction handle, ...).
    Opaque(Opaque),
}

/// Shared, type-erased native object.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    /// Wrap a native object.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an already shared native object.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// Borrow the object as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Get a shared handle to the object as `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque(..)")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(&a.0, &b.0),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
                _ => false,
            },
        }
    }
}

impl Value {
    /// Name of the value's type as used by slot metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Opaque(_) => "opaque",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Truthiness used by conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !(s.is_empty() || s == "false" || s == "0"),
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
            Self::Opaque(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Numeric view; numeric strings and booleans coerce.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer view; integral floats and numeric strings coerce.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Text rendering used by templates, logs and response bodies.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Nil => String::new(),
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Opaque(_) => "<opaque>".to_string(),
            Self::List(_) | Self::Map(_) => self.to_json().to_string(),
        }
    }

    /// Build a float, keeping integral results as `Int`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn number(f: f64) -> Self {
        if f.fract() == 0.0 && f.abs() < 9.0e15 {
            Self::Int(f as i64)
        } else {
            Self::Float(f)
        }
    }

    /// Loose equality: numbers compare numerically with numeric strings.
    pub fn loose_eq(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Self::String(_), b) if b.is_number() => {
                self.as_number().is_some_and(|a| Some(a) == b.as_number())
            }
            (a, Self::String(_)) if a.is_number() => {
                other.as_number().is_some_and(|b| Some(b) == a.as_number())
            }
            (Self::Nil, Self::String(s)) | (Self::String(s), Self::Nil) => s.is_empty(),
            _ => false,
        }
    }

    /// Ordering for `<`, `>`: numeric when both coerce, otherwise textual.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if let (Self::String(a), Self::String(b)) = (self, other) {
            if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                return x.partial_cmp(&y);
            }
            return Some(a.cmp(b));
        }
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }

    /// `+`: strings take precedence and concatenate.
    ///
    /// # Errors
    ///
    /// Fails when neither operand is a string and either is not numeric.
    pub fn add(&self, other: &Self) -> Result<Self, RuntimeError> {
        match (self, other) {
            (Self::String(a), b) => Ok(Self::String(format!("{a}{}", b.to_display_string()))),
            (a, Self::String(b)) => Ok(Self::String(format!("{}{b}", a.to_display_string()))),
            (Self::Int(a), Self::Int(b)) => Ok(a
                .checked_add(*b)
                .map_or_else(|| Self::number(f64_of(*a) + f64_of(*b)), Self::Int)),
            (Self::List(a), Self::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Self::List(out))
            }
            _ => self.numeric(other, "+", |a, b| a + b),
        }
    }

    /// `-`
    ///
    /// # Errors
    ///
    /// Fails for non-numeric operands.
    pub fn sub(&self, other: &Self) -> Result<Self, RuntimeError> {
        if let (Self::Int(a), Self::Int(b)) = (self, other) {
            if let Some(v) = a.checked_sub(*b) {
                return Ok(Self::Int(v));
            }
        }
        self.numeric(other, "-", |a, b| a - b)
    }

    /// `*`
    ///
    /// # Errors
    ///
    /// Fails for non-numeric operands.
    pub fn mul(&self, other: &Self) -> Result<Self, RuntimeError> {
        if let (Self::Int(a), Self::Int(b)) = (self, other) {
            if let Some(v) = a.checked_mul(*b) {
                return Ok(Self::Int(v));
            }
        }
        self.numeric(other, "*", |a, b| a * b)
    }

    /// `/`
    ///
    /// # Errors
    ///
    /// Fails for non-numeric operands and division by zero.
    pub fn div(&self, other: &Self) -> Result<Self, RuntimeError> {
        if other.as_number() == Some(0.0) {
            return Err(RuntimeError::failed("division by zero"));
        }
        self.numeric(other, "/", |a, b| a / b)
    }

    /// `%`
    ///
    /// # Errors
    ///
    /// Fails for non-numeric operands and modulo by zero.
    pub fn rem(&self, other: &Self) -> Result<Self, RuntimeError> {
        if other.as_number() == Some(0.0) {
            return Err(RuntimeError::failed("modulo by zero"));
        }
        if let (Self::Int(a), Self::Int(b)) = (self, other) {
            if let Some(v) = a.checked_rem(*b) {
                return Ok(Self::Int(v));
            }
        }
        self.numeric(other, "%", |a, b| a % b)
    }

    fn numeric(
        &self,
        other: &Self,
        op: &str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Self, RuntimeError> {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => Ok(Self::number(f(a, b))),
            _ => Err(RuntimeError::failed(format!(
                "cannot apply '{op}' to {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Convert from JSON; objects keep their key order.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON; opaque objects become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Nil | Self::Opaque(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(l) => serde_json::Value::Array(l.iter().map(Self::to_json).collect()),
            Self::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn f64_of(i: i64) -> f64 {
    i as f64
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{f:.0}")
    } else {
        f.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Self::List(l)
    }
}

impl From<ValueMap> for Value {
    fn from(m: ValueMap) -> Self {
        Self::Map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}
