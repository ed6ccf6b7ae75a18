//! Query builder state and SQL rendering.
//!
//! Fluent slots mutate a [`QueryState`]; terminal slots render it for a
//! [`Dialect`]. Values never reach the SQL text: every one becomes a
//! positional argument. Identifiers are quoted by the dialect, and the few
//! raw fragments (`ORDER BY`, aggregate columns) are restricted to
//! identifier characters.

use zeno_common::RuntimeError;
use zeno_core::{Value, ValueMap};

use crate::dialect::Dialect;

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    In,
    NotIn,
    Between,
    NotBetween,
    Null,
    NotNull,
}

impl Op {
    /// Parse an operator as written in a program (`=`, `in`, `not between`).
    ///
    /// # Errors
    ///
    /// Returns `Failed` for unknown operators.
    pub fn parse(text: &str) -> Result<Self, RuntimeError> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let op = match normalized.to_ascii_uppercase().as_str() {
            "=" | "==" => Self::Eq,
            "!=" | "<>" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "LIKE" => Self::Like,
            "NOT LIKE" => Self::NotLike,
            "IN" => Self::In,
            "NOT IN" => Self::NotIn,
            "BETWEEN" => Self::Between,
            "NOT BETWEEN" => Self::NotBetween,
            "NULL" | "IS NULL" => Self::Null,
            "NOT NULL" | "IS NOT NULL" => Self::NotNull,
            _ => {
                return Err(RuntimeError::failed(format!(
                    "unsupported query operator '{text}'"
                )));
            }
        };
        Ok(op)
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Between => "BETWEEN",
            Self::NotBetween => "NOT BETWEEN",
            Self::Null => "IS NULL",
            Self::NotNull => "IS NOT NULL",
        }
    }
}

/// How a condition joins the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub conjunction: Conjunction,
    pub column: String,
    pub op: Op,
    /// One value, two for `BETWEEN`, any number for `IN`, none for `NULL`.
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub first: String,
    pub op: String,
    pub second: String,
}

/// Accumulated state of one fluent query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub table: String,
    /// Named connection; `None` selects the default.
    pub db: Option<String>,
    pub columns: Vec<String>,
    pub wheres: Vec<Condition>,
    pub joins: Vec<Join>,
    pub group_by: Vec<String>,
    pub having: Vec<Condition>,
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Rendered SQL plus its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

struct Writer<'d> {
    dialect: &'d dyn Dialect,
    sql: String,
    args: Vec<Value>,
}

impl<'d> Writer<'d> {
    fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            args: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn bind(&mut self, value: Value) {
        self.args.push(value);
        let placeholder = self.dialect.placeholder(self.args.len());
        self.sql.push_str(&placeholder);
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            args: self.args,
        }
    }
}

/// True for `name`, `t.name` and `*` style identifiers.
fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '*')
}

/// Validate a raw `ORDER BY` / `GROUP BY` / aggregate fragment.
fn raw_fragment(text: &str) -> Result<String, RuntimeError> {
    let ok = text.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '*' | '(' | ')' | ',' | ' ')
    });
    if ok && !text.trim().is_empty() {
        Ok(text.trim().to_string())
    } else {
        Err(RuntimeError::security(format!(
            "refusing raw SQL fragment '{text}'"
        )))
    }
}

/// Split a list given either as a list value or as `"a, b"` text.
pub fn split_list(value: &Value) -> Vec<String> {
    match value {
        Value::List(items) => items.iter().map(Value::to_display_string).collect(),
        Value::Nil => Vec::new(),
        other => other
            .to_display_string()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    }
}

/// Values for `IN`: a list, a JSON list literal or comma separated text.
pub fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        Value::Nil => Vec::new(),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('[') {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
                    if let Value::List(items) = Value::from_json(json) {
                        return items;
                    }
                }
            }
            trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::String(s.trim_matches(|c| c == '"' || c == '\'').to_string()),
                })
                .collect()
        }
        other => vec![other.clone()],
    }
}

impl QueryState {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Add a condition, checking the value count against the operator.
    ///
    /// # Errors
    ///
    /// Fails for a `BETWEEN` without exactly two bounds.
    pub fn add_where(
        &mut self,
        conjunction: Conjunction,
        column: impl Into<String>,
        op: Op,
        values: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let condition = condition(conjunction, column.into(), op, values)?;
        self.wheres.push(condition);
        Ok(())
    }

    /// Add a `HAVING` condition.
    ///
    /// # Errors
    ///
    /// Fails for a `BETWEEN` without exactly two bounds.
    pub fn add_having(
        &mut self,
        column: impl Into<String>,
        op: Op,
        values: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let condition = condition(Conjunction::And, column.into(), op, values)?;
        self.having.push(condition);
        Ok(())
    }

    fn column(&self, dialect: &dyn Dialect, column: &str) -> Result<String, RuntimeError> {
        if let Some((expr, alias)) = split_alias(column) {
            return Ok(format!(
                "{} AS {}",
                self.column(dialect, expr)?,
                dialect.quote(alias)
            ));
        }
        if is_identifier(column) {
            Ok(dialect.quote(column))
        } else {
            raw_fragment(column)
        }
    }

    fn from_clause(&self, w: &mut Writer<'_>) -> Result<(), RuntimeError> {
        if self.table.is_empty() {
            return Err(RuntimeError::failed("query has no table"));
        }
        let table = w.dialect.quote(&self.table);
        w.push(" FROM ");
        w.push(&table);
        for join in &self.joins {
            let keyword = match join.kind {
                JoinKind::Inner => " INNER JOIN ",
                JoinKind::Left => " LEFT JOIN ",
                JoinKind::Right => " RIGHT JOIN ",
            };
            if !matches!(join.op.as_str(), "=" | "!=" | "<>" | "<" | "<=" | ">" | ">=") {
                return Err(RuntimeError::failed(format!(
                    "unsupported join operator '{}'",
                    join.op
                )));
            }
            let on = format!(
                "{keyword}{} ON {} {} {}",
                w.dialect.quote(&join.table),
                self.column(w.dialect, &join.first)?,
                join.op,
                self.column(w.dialect, &join.second)?
            );
            w.push(&on);
        }
        Ok(())
    }

    fn conditions(
        &self,
        w: &mut Writer<'_>,
        keyword: &str,
        conditions: &[Condition],
    ) -> Result<(), RuntimeError> {
        for (i, c) in conditions.iter().enumerate() {
            if i == 0 {
                w.push(keyword);
            } else {
                w.push(match c.conjunction {
                    Conjunction::And => " AND ",
                    Conjunction::Or => " OR ",
                });
            }
            let column = self.column(w.dialect, &c.column)?;
            w.push(&column);
            w.push(" ");
            w.push(c.op.sql());
            match c.op {
                Op::Null | Op::NotNull => {}
                Op::In | Op::NotIn => {
                    w.push(" (");
                    for (j, value) in c.values.iter().enumerate() {
                        if j > 0 {
                            w.push(", ");
                        }
                        w.bind(value.clone());
                    }
                    w.push(")");
                }
                Op::Between | Op::NotBetween => {
                    w.push(" ");
                    w.bind(c.values.first().cloned().unwrap_or_default());
                    w.push(" AND ");
                    w.bind(c.values.get(1).cloned().unwrap_or_default());
                }
                _ => {
                    w.push(" ");
                    w.bind(c.values.first().cloned().unwrap_or_default());
                }
            }
        }
        Ok(())
    }

    fn filters(&self, w: &mut Writer<'_>) -> Result<(), RuntimeError> {
        self.from_clause(w)?;
        self.conditions(w, " WHERE ", &self.wheres)?;
        if !self.group_by.is_empty() {
            let groups = self
                .group_by
                .iter()
                .map(|g| self.column(w.dialect, g))
                .collect::<Result<Vec<_>, _>>()?;
            w.push(" GROUP BY ");
            w.push(&groups.join(", "));
        }
        self.conditions(w, " HAVING ", &self.having)?;
        Ok(())
    }

    /// `SELECT` with ordering, limit and offset.
    ///
    /// # Errors
    ///
    /// Fails when the state has no table or carries an unsafe fragment.
    pub fn select(&self, dialect: &dyn Dialect) -> Result<Statement, RuntimeError> {
        self.select_with(dialect, self.limit, self.offset)
    }

    fn select_with(
        &self,
        dialect: &dyn Dialect,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Statement, RuntimeError> {
        let mut w = Writer::new(dialect);
        w.push("SELECT ");
        if self.columns.is_empty() {
            w.push("*");
        } else {
            let columns = self
                .columns
                .iter()
                .map(|c| self.column(dialect, c))
                .collect::<Result<Vec<_>, _>>()?;
            w.push(&columns.join(", "));
        }
        self.filters(&mut w)?;
        if !self.order_by.is_empty() {
            let orders = self
                .order_by
                .iter()
                .map(|o| raw_fragment(o))
                .collect::<Result<Vec<_>, _>>()?;
            w.push(" ORDER BY ");
            w.push(&orders.join(", "));
        }
        w.push(&dialect.limit_offset(limit, offset));
        Ok(w.finish())
    }

    /// One page of rows: `per_page` rows starting at page `page` (1-based).
    ///
    /// # Errors
    ///
    /// Same as [`QueryState::select`].
    pub fn page(
        &self,
        dialect: &dyn Dialect,
        per_page: u64,
        page: u64,
    ) -> Result<Statement, RuntimeError> {
        let offset = per_page.saturating_mul(page.saturating_sub(1));
        self.select_with(dialect, Some(per_page), Some(offset))
    }

    /// `SELECT COUNT(*)` over the same joins and filters.
    ///
    /// # Errors
    ///
    /// Same as [`QueryState::select`].
    pub fn count(&self, dialect: &dyn Dialect) -> Result<Statement, RuntimeError> {
        if self.group_by.is_empty() {
            return self.aggregate(dialect, "COUNT", "*");
        }
        let inner = Self {
            order_by: Vec::new(),
            limit: None,
            offset: None,
            ..self.clone()
        }
        .select(dialect)?;
        Ok(Statement {
            sql: format!("SELECT COUNT(*) AS aggregate FROM ({}) AS grouped", inner.sql),
            args: inner.args,
        })
    }

    /// `SELECT <func>(<column>) AS aggregate` over the filters.
    ///
    /// # Errors
    ///
    /// Same as [`QueryState::select`].
    pub fn aggregate(
        &self,
        dialect: &dyn Dialect,
        function: &str,
        column: &str,
    ) -> Result<Statement, RuntimeError> {
        let target = if column == "*" {
            "*".to_string()
        } else {
            self.column(dialect, column)?
        };
        let mut w = Writer::new(dialect);
        w.push(&format!("SELECT {function}({target}) AS aggregate"));
        self.filters(&mut w)?;
        Ok(w.finish())
    }

    /// `SELECT 1 ... LIMIT 1`.
    ///
    /// # Errors
    ///
    /// Same as [`QueryState::select`].
    pub fn exists(&self, dialect: &dyn Dialect) -> Result<Statement, RuntimeError> {
        let mut w = Writer::new(dialect);
        w.push("SELECT 1");
        self.filters(&mut w)?;
        w.push(&dialect.limit_offset(Some(1), None));
        Ok(w.finish())
    }

    /// `INSERT INTO ... VALUES (...)`, with `RETURNING id` where supported.
    ///
    /// # Errors
    ///
    /// Fails on empty data.
    pub fn insert(&self, dialect: &dyn Dialect, data: &ValueMap) -> Result<Statement, RuntimeError> {
        if data.is_empty() {
            return Err(RuntimeError::failed("insert requires at least one column"));
        }
        let mut w = Writer::new(dialect);
        let columns = data
            .keys()
            .map(|k| self.column(dialect, k))
            .collect::<Result<Vec<_>, _>>()?;
        w.push(&format!(
            "INSERT INTO {} ({}) VALUES (",
            dialect.quote(&self.table),
            columns.join(", ")
        ));
        for (i, value) in data.values().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.bind(value.clone());
        }
        w.push(")");
        if dialect.supports_returning() {
            w.push(" RETURNING id");
        }
        Ok(w.finish())
    }

    /// `UPDATE ... SET ... WHERE ...`.
    ///
    /// # Errors
    ///
    /// Fails on empty data.
    pub fn update(&self, dialect: &dyn Dialect, data: &ValueMap) -> Result<Statement, RuntimeError> {
        if data.is_empty() {
            return Err(RuntimeError::failed("update requires at least one column"));
        }
        let mut w = Writer::new(dialect);
        w.push(&format!("UPDATE {} SET ", dialect.quote(&self.table)));
        for (i, (column, value)) in data.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let column = self.column(dialect, column)?;
            w.push(&column);
            w.push(" = ");
            w.bind(value.clone());
        }
        self.conditions(&mut w, " WHERE ", &self.wheres)?;
        Ok(w.finish())
    }

    /// `DELETE FROM ... WHERE ...`.
    ///
    /// # Errors
    ///
    /// Fails when the state has no table.
    pub fn delete(&self, dialect: &dyn Dialect) -> Result<Statement, RuntimeError> {
        if self.table.is_empty() {
            return Err(RuntimeError::failed("query has no table"));
        }
        let mut w = Writer::new(dialect);
        w.push(&format!("DELETE FROM {}", dialect.quote(&self.table)));
        self.conditions(&mut w, " WHERE ", &self.wheres)?;
        Ok(w.finish())
    }
}

fn condition(
    conjunction: Conjunction,
    column: String,
    op: Op,
    values: Vec<Value>,
) -> Result<Condition, RuntimeError> {
    match op {
        Op::Between | Op::NotBetween if values.len() != 2 => Err(RuntimeError::failed(format!(
            "{} on '{column}' needs two bounds, got {}",
            op.sql(),
            values.len()
        ))),
        Op::In | Op::NotIn if values.is_empty() => Err(RuntimeError::failed(format!(
            "{} on '{column}' needs at least one value",
            op.sql()
        ))),
        _ => Ok(Condition {
            conjunction,
            column,
            op,
            values,
        }),
    }
}

fn split_alias(column: &str) -> Option<(&str, &str)> {
    let lower = column.to_ascii_lowercase();
    let at = lower.find(" as ")?;
    Some((column[..at].trim(), column[at + 4..].trim()))
}
