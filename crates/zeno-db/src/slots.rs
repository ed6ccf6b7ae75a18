//! Query, terminal and transaction slots.
//!
//! ```text
//! table: users
//! where: status
//!   value: active
//! where_in: id
//!   values: [1, 2, 3]
//! order_by: "id DESC"
//! get:
//!   as: $users
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use zeno_common::RuntimeError;
use zeno_core::scope::{ACTIVE_TX_KEY, QUERY_STATE_KEY};
use zeno_core::{
    Context, Engine, Node, Opaque, Scope, SlotHandler, SlotMetadata, Value, ValueMap,
};

use crate::executor::{Executor, TxHandle, active_transaction};
use crate::manager::DatabaseManager;
use crate::query::{Conjunction, Join, JoinKind, Op, QueryState, Statement, split_list, value_list};

type SharedQuery = Mutex<QueryState>;

/// Run `fut` within the context deadline.
async fn bounded<T>(
    ctx: &Context,
    fut: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    match ctx.remaining() {
        Some(remaining) => tokio::time::timeout(remaining, fut)
            .await
            .map_err(|_| ctx.timeout_error())?,
        None => fut.await,
    }
}

fn query_state(scope: &Scope) -> Result<Arc<SharedQuery>, RuntimeError> {
    scope
        .get(QUERY_STATE_KEY)
        .and_then(|v| v.as_opaque().and_then(Opaque::downcast::<SharedQuery>))
        .ok_or_else(|| RuntimeError::failed("no active query; start one with `table`"))
}

fn bind_result(node: &Node, scope: &Scope, value: Value) {
    if let Some(target) = node.as_name() {
        scope.set(target, value);
    }
}

fn non_negative(value: &Value, what: &str) -> Result<u64, RuntimeError> {
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| RuntimeError::failed(format!("{what} must be a non-negative integer")))
}

fn text(engine: &Engine, node: &Node, scope: &Scope, attr: &str) -> Result<String, RuntimeError> {
    let value = engine.value_or_attr(node, attr, scope)?;
    if value.is_nil() {
        return Err(RuntimeError::failed(format!(
            "{} requires a {attr}",
            node.name
        )));
    }
    Ok(value.to_display_string())
}

/// `table`, `model`, `query`: install a fresh query state.
struct Table;

#[async_trait]
impl SlotHandler for Table {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let mut state = QueryState::new(text(engine, node, scope, "name")?);
        state.db = engine.attr_string(node, "db", scope)?;
        if let Some(columns) = engine.attr(node, "columns", scope)? {
            state.columns = split_list(&columns);
        }
        scope.set(
            QUERY_STATE_KEY,
            Value::Opaque(Opaque::new(Mutex::new(state))),
        );
        engine
            .execute_body(ctx, node, scope, &["name", "db", "columns"])
            .await
    }
}

#[derive(Debug, Clone, Copy)]
enum Fluent {
    Where(Conjunction),
    WhereIn { negated: bool },
    WhereNull { negated: bool },
    WhereBetween,
    Join(JoinKind),
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Offset,
    Columns,
}

struct FluentSlot(Fluent);

#[async_trait]
impl SlotHandler for FluentSlot {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let shared = query_state(scope)?;
        let attr = |name: &str| -> Result<Value, RuntimeError> {
            Ok(engine.attr(node, name, scope)?.unwrap_or_default())
        };

        match self.0 {
            Fluent::Where(conjunction) => {
                let column = text(engine, node, scope, "column")?;
                let op = Op::parse(
                    &engine
                        .attr_string(node, "op", scope)?
                        .unwrap_or_else(|| "=".into()),
                )?;
                let values = match op {
                    Op::Null | Op::NotNull => Vec::new(),
                    Op::In | Op::NotIn | Op::Between | Op::NotBetween => {
                        let mut values = attr("values")?;
                        if values.is_nil() {
                            values = attr("value")?;
                        }
                        value_list(&values)
                    }
                    _ => vec![attr("value")?],
                };
                shared.lock().add_where(conjunction, column, op, values)?;
            }
            Fluent::WhereIn { negated } => {
                let column = text(engine, node, scope, "column")?;
                let op = if negated { Op::NotIn } else { Op::In };
                let values = value_list(&attr("values")?);
                shared.lock().add_where(Conjunction::And, column, op, values)?;
            }
            Fluent::WhereNull { negated } => {
                let column = text(engine, node, scope, "column")?;
                let op = if negated { Op::NotNull } else { Op::Null };
                shared
                    .lock()
                    .add_where(Conjunction::And, column, op, Vec::new())?;
            }
            Fluent::WhereBetween => {
                let column = text(engine, node, scope, "column")?;
                let values = match attr("values")? {
                    Value::Nil => vec![attr("min")?, attr("max")?],
                    list => value_list(&list),
                };
                shared
                    .lock()
                    .add_where(Conjunction::And, column, Op::Between, values)?;
            }
            Fluent::Join(kind) => {
                let table = text(engine, node, scope, "table")?;
                let (first, op, second) = match engine.attr_string(node, "on", scope)? {
                    Some(on) => {
                        let parts: Vec<&str> = on.split_whitespace().collect();
                        match parts.as_slice() {
                            [first, op, second] => {
                                ((*first).to_string(), (*op).to_string(), (*second).to_string())
                            }
                            _ => {
                                return Err(RuntimeError::failed(format!(
                                    "join condition '{on}' must look like 'a.id = b.a_id'"
                                )));
                            }
                        }
                    }
                    None => (
                        attr("first")?.to_display_string(),
                        engine
                            .attr_string(node, "op", scope)?
                            .unwrap_or_else(|| "=".into()),
                        attr("second")?.to_display_string(),
                    ),
                };
                shared.lock().joins.push(Join {
                    kind,
                    table,
                    first,
                    op,
                    second,
                });
            }
            Fluent::GroupBy => {
                let groups = split_list(&engine.value_or_attr(node, "columns", scope)?);
                shared.lock().group_by.extend(groups);
            }
            Fluent::Having => {
                let column = text(engine, node, scope, "column")?;
                let op = Op::parse(
                    &engine
                        .attr_string(node, "op", scope)?
                        .unwrap_or_else(|| "=".into()),
                )?;
                let values = match op {
                    Op::Null | Op::NotNull => Vec::new(),
                    _ => vec![attr("value")?],
                };
                shared.lock().add_having(column, op, values)?;
            }
            Fluent::OrderBy => {
                let column = text(engine, node, scope, "column")?;
                let order = match engine.attr_string(node, "direction", scope)? {
                    Some(direction) => format!("{column} {direction}"),
                    None => column,
                };
                shared.lock().order_by.push(order);
            }
            Fluent::Limit => {
                let limit = non_negative(&engine.value_or_attr(node, "count", scope)?, "limit")?;
                shared.lock().limit = Some(limit);
            }
            Fluent::Offset => {
                let offset = non_negative(&engine.value_or_attr(node, "count", scope)?, "offset")?;
                shared.lock().offset = Some(offset);
            }
            Fluent::Columns => {
                let columns = split_list(&engine.value_or_attr(node, "columns", scope)?);
                shared.lock().columns = columns;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Terminal {
    Get,
    First,
    Count,
    Exists,
    Aggregate(&'static str),
    Insert,
    Update,
    Delete,
    Paginate,
}

struct TerminalSlot {
    manager: Arc<DatabaseManager>,
    kind: Terminal,
}

/// Column data for `insert`/`update`: a `data` map or the plain attributes.
fn data_of(engine: &Engine, node: &Node, scope: &Scope) -> Result<ValueMap, RuntimeError> {
    let data = match engine.attr(node, "data", scope)? {
        Some(value) => value,
        None if !node.value.is_nil() => engine.resolve(&node.value, scope)?,
        None => Value::Map(engine.attributes(node, scope, &["as", "db"])?),
    };
    match data {
        Value::Map(map) => Ok(map),
        other => Err(RuntimeError::failed(format!(
            "{} expects a map of columns, got {}",
            node.name,
            other.type_name()
        ))),
    }
}

#[async_trait]
impl SlotHandler for TerminalSlot {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let state = query_state(scope)?.lock().clone();
        let db = engine.attr_string(node, "db", scope)?.or_else(|| state.db.clone());
        let exec = Executor::resolve(&self.manager, scope, db.as_deref())?;
        let dialect = exec.dialect();

        let result = match self.kind {
            Terminal::Get => {
                let stmt = state.select(dialect)?;
                let rows = bounded(ctx, exec.fetch_all(&stmt)).await?;
                Value::List(rows.into_iter().map(Value::Map).collect())
            }
            Terminal::First => {
                let stmt = QueryState {
                    limit: Some(1),
                    ..state
                }
                .select(dialect)?;
                let rows = bounded(ctx, exec.fetch_all(&stmt)).await?;
                rows.into_iter().next().map_or(Value::Nil, Value::Map)
            }
            Terminal::Count => {
                let stmt = state.count(dialect)?;
                bounded(ctx, exec.scalar(&stmt)).await?
            }
            Terminal::Exists => {
                let stmt = state.exists(dialect)?;
                let rows = bounded(ctx, exec.fetch_all(&stmt)).await?;
                Value::Bool(!rows.is_empty())
            }
            Terminal::Aggregate(function) => {
                let column = text(engine, node, scope, "column")?;
                let stmt = state.aggregate(dialect, function, &column)?;
                bounded(ctx, exec.scalar(&stmt)).await?
            }
            Terminal::Insert => {
                let data = data_of(engine, node, scope)?;
                let stmt = state.insert(dialect, &data)?;
                if dialect.supports_returning() {
                    let rows = bounded(ctx, exec.fetch_all(&stmt)).await?;
                    rows.into_iter()
                        .next()
                        .and_then(|mut row| row.swap_remove("id"))
                        .unwrap_or_default()
                } else {
                    let done = bounded(ctx, exec.execute(&stmt)).await?;
                    done.last_insert_id.map_or(Value::Nil, Value::Int)
                }
            }
            Terminal::Update => {
                let data = data_of(engine, node, scope)?;
                let stmt = state.update(dialect, &data)?;
                affected(bounded(ctx, exec.execute(&stmt)).await?.rows_affected)
            }
            Terminal::Delete => {
                let stmt = state.delete(dialect)?;
                affected(bounded(ctx, exec.execute(&stmt)).await?.rows_affected)
            }
            Terminal::Paginate => paginate(ctx, engine, node, scope, &state, &exec).await?,
        };

        bind_result(node, scope, result);
        Ok(())
    }
}

fn affected(rows: u64) -> Value {
    Value::Int(i64::try_from(rows).unwrap_or(i64::MAX))
}

async fn paginate(
    ctx: &Context,
    engine: &Engine,
    node: &Node,
    scope: &Scope,
    state: &QueryState,
    exec: &Executor,
) -> Result<Value, RuntimeError> {
    let per_page = match engine.attr(node, "per_page", scope)? {
        Some(v) => non_negative(&v, "per_page")?.max(1),
        None => 15,
    };
    let page = match engine.attr(node, "page", scope)? {
        Some(v) if !v.is_nil() => non_negative(&v, "page")?.max(1),
        _ => 1,
    };
    let dialect = exec.dialect();

    let total = bounded(ctx, exec.scalar(&state.count(dialect)?))
        .await?
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0);
    let rows = bounded(ctx, exec.fetch_all(&state.page(dialect, per_page, page)?)).await?;

    let last_page = total.div_ceil(per_page).max(1);
    let (from, to) = row_window(per_page, page, rows.len() as u64);

    let int = |n: u64| Value::Int(i64::try_from(n).unwrap_or(i64::MAX));
    let mut map = ValueMap::new();
    map.insert(
        "data".into(),
        Value::List(rows.into_iter().map(Value::Map).collect()),
    );
    map.insert("total".into(), int(total));
    map.insert("per_page".into(), int(per_page));
    map.insert("current_page".into(), int(page));
    map.insert("last_page".into(), int(last_page));
    map.insert("from".into(), int(from));
    map.insert("to".into(), int(to));
    Ok(Value::Map(map))
}

/// 1-based positions of the first and last row on a page; `(0, 0)` when empty.
fn row_window(per_page: u64, page: u64, returned: u64) -> (u64, u64) {
    if returned == 0 {
        return (0, 0);
    }
    let offset = per_page.saturating_mul(page.saturating_sub(1));
    (offset.saturating_add(1), offset.saturating_add(returned))
}

/// `db.transaction`: run the body in a transaction, commit or roll back.
struct Transaction {
    manager: Arc<DatabaseManager>,
}

#[async_trait]
impl SlotHandler for Transaction {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        if active_transaction(scope).is_some() {
            return Err(RuntimeError::failed("nested transactions are not supported"));
        }
        let db = engine.attr_string(node, "db", scope)?;
        let connection = self.manager.get(db.as_deref())?;
        let tx = Arc::new(bounded(ctx, TxHandle::begin(&connection)).await?);

        scope.set(ACTIVE_TX_KEY, Value::Opaque(Opaque::from_arc(Arc::clone(&tx))));
        let result = engine.execute_body(ctx, node, scope, &["db"]).await;
        scope.remove(ACTIVE_TX_KEY);

        match result {
            Ok(()) => tx.commit().await,
            // `http.response` inside a transaction is a clean exit.
            Err(err) if err.is_sentinel() => {
                tx.commit().await?;
                Err(err)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(db = %connection.name, error = %rollback, "rollback failed");
                }
                tracing::debug!(db = %connection.name, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}

/// `db.execute` and `db.select`: raw SQL with positional `bindings`.
struct Raw {
    manager: Arc<DatabaseManager>,
    select: bool,
}

#[async_trait]
impl SlotHandler for Raw {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let sql = text(engine, node, scope, "sql")?;
        let args = match engine.attr(node, "bindings", scope)? {
            Some(Value::List(items)) => items,
            Some(Value::Nil) | None => Vec::new(),
            Some(other) => vec![other],
        };
        let db = engine.attr_string(node, "db", scope)?;
        let exec = Executor::resolve(&self.manager, scope, db.as_deref())?;
        let stmt = Statement { sql, args };

        let result = if self.select {
            let rows = bounded(ctx, exec.fetch_all(&stmt)).await?;
            Value::List(rows.into_iter().map(Value::Map).collect())
        } else {
            affected(bounded(ctx, exec.execute(&stmt)).await?.rows_affected)
        };
        bind_result(node, scope, result);
        Ok(())
    }
}

/// Register every database slot on `engine`.
pub fn register(engine: &Engine, manager: &Arc<DatabaseManager>) {
    for name in ["table", "model", "query"] {
        engine.register(
            name,
            Arc::new(Table),
            SlotMetadata::new("Start a query builder on a table")
                .example("table: users")
                .required("name", "string", "Table name")
                .input("db", "string", "Named connection")
                .input("columns", "any", "Selected columns"),
        );
    }

    let fluent = [
        (
            "where",
            Fluent::Where(Conjunction::And),
            SlotMetadata::new("Add an AND condition")
                .required("column", "string", "Column name")
                .input("op", "string", "Comparison operator (default `=`)")
                .input("value", "any", "Compared value"),
        ),
        (
            "or_where",
            Fluent::Where(Conjunction::Or),
            SlotMetadata::new("Add an OR condition")
                .required("column", "string", "Column name")
                .input("op", "string", "Comparison operator (default `=`)")
                .input("value", "any", "Compared value"),
        ),
        (
            "where_in",
            Fluent::WhereIn { negated: false },
            SlotMetadata::new("Column value is one of a list")
                .required("column", "string", "Column name")
                .input("values", "any", "List or `[1,2]` text"),
        ),
        (
            "where_not_in",
            Fluent::WhereIn { negated: true },
            SlotMetadata::new("Column value is none of a list")
                .required("column", "string", "Column name")
                .input("values", "any", "List or `[1,2]` text"),
        ),
        (
            "where_null",
            Fluent::WhereNull { negated: false },
            SlotMetadata::new("Column is NULL").required("column", "string", "Column name"),
        ),
        (
            "where_not_null",
            Fluent::WhereNull { negated: true },
            SlotMetadata::new("Column is not NULL").required("column", "string", "Column name"),
        ),
        (
            "where_between",
            Fluent::WhereBetween,
            SlotMetadata::new("Column lies within inclusive bounds")
                .required("column", "string", "Column name")
                .input("min", "any", "Lower bound")
                .input("max", "any", "Upper bound")
                .input("values", "list", "Both bounds"),
        ),
        (
            "join",
            Fluent::Join(JoinKind::Inner),
            SlotMetadata::new("Inner join another table")
                .required("table", "string", "Joined table")
                .input("on", "string", "`a.id = b.a_id`"),
        ),
        (
            "left_join",
            Fluent::Join(JoinKind::Left),
            SlotMetadata::new("Left join another table")
                .required("table", "string", "Joined table")
                .input("on", "string", "`a.id = b.a_id`"),
        ),
        (
            "right_join",
            Fluent::Join(JoinKind::Right),
            SlotMetadata::new("Right join another table")
                .required("table", "string", "Joined table")
                .input("on", "string", "`a.id = b.a_id`"),
        ),
        (
            "group_by",
            Fluent::GroupBy,
            SlotMetadata::new("Group rows").required("columns", "any", "Columns"),
        ),
        (
            "having",
            Fluent::Having,
            SlotMetadata::new("Filter groups")
                .required("column", "string", "Column or aggregate")
                .input("op", "string", "Comparison operator")
                .input("value", "any", "Compared value"),
        ),
        (
            "order_by",
            Fluent::OrderBy,
            SlotMetadata::new("Sort rows")
                .example("order_by: \"id DESC\"")
                .required("column", "string", "Column, optionally with direction")
                .input("direction", "string", "ASC or DESC"),
        ),
        (
            "columns",
            Fluent::Columns,
            SlotMetadata::new("Select specific columns").required("columns", "any", "Columns"),
        ),
    ];
    for (name, kind, meta) in fluent {
        engine.register(name, Arc::new(FluentSlot(kind)), meta);
    }
    engine.register(
        "limit",
        Arc::new(FluentSlot(Fluent::Limit)),
        SlotMetadata::new("Cap the number of rows")
            .required("count", "int", "Maximum rows")
            .value_type("int"),
    );
    engine.register(
        "offset",
        Arc::new(FluentSlot(Fluent::Offset)),
        SlotMetadata::new("Skip rows")
            .required("count", "int", "Rows to skip")
            .value_type("int"),
    );

    let terminals = [
        ("get", Terminal::Get, "Fetch all matching rows"),
        ("first", Terminal::First, "Fetch the first matching row or nil"),
        ("count", Terminal::Count, "Count matching rows"),
        ("exists", Terminal::Exists, "Whether any row matches"),
        ("sum", Terminal::Aggregate("SUM"), "Sum a column"),
        ("avg", Terminal::Aggregate("AVG"), "Average a column"),
        ("min", Terminal::Aggregate("MIN"), "Smallest value of a column"),
        ("max", Terminal::Aggregate("MAX"), "Largest value of a column"),
        ("insert", Terminal::Insert, "Insert a row; binds the new id"),
        ("update", Terminal::Update, "Update matching rows; binds the count"),
        ("delete", Terminal::Delete, "Delete matching rows; binds the count"),
        ("paginate", Terminal::Paginate, "Fetch one page with totals"),
    ];
    for (name, kind, description) in terminals {
        let mut meta = SlotMetadata::new(description)
            .input("as", "string", "Result variable")
            .input("db", "string", "Named connection");
        meta = match kind {
            Terminal::Aggregate(_) => meta.required("column", "string", "Aggregated column"),
            Terminal::Paginate => meta
                .input("per_page", "int", "Rows per page (default 15)")
                .input("page", "int", "1-based page (default 1)"),
            Terminal::Insert | Terminal::Update => meta.input("data", "map", "Column values"),
            _ => meta,
        };
        engine.register(
            name,
            Arc::new(TerminalSlot {
                manager: Arc::clone(manager),
                kind,
            }),
            meta,
        );
    }

    engine.register(
        "db.transaction",
        Arc::new(Transaction {
            manager: Arc::clone(manager),
        }),
        SlotMetadata::new("Run the body atomically; roll back on any error")
            .input("db", "string", "Named connection")
            .block("do"),
    );
    engine.register(
        "db.execute",
        Arc::new(Raw {
            manager: Arc::clone(manager),
            select: false,
        }),
        SlotMetadata::new("Run a raw statement; binds the affected row count")
            .required("sql", "string", "Statement with dialect placeholders")
            .input("bindings", "list", "Positional arguments")
            .input("as", "string", "Result variable")
            .input("db", "string", "Named connection"),
    );
    engine.register(
        "db.select",
        Arc::new(Raw {
            manager: Arc::clone(manager),
            select: true,
        }),
        SlotMetadata::new("Run a raw query; binds the rows")
            .required("sql", "string", "Query with dialect placeholders")
            .input("bindings", "list", "Positional arguments")
            .input("as", "string", "Result variable")
            .input("db", "string", "Named connection"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_window() {
        assert_eq!(row_window(15, 1, 15), (1, 15));
        assert_eq!(row_window(10, 3, 4), (21, 24));
        assert_eq!(row_window(10, 3, 0), (0, 0));
    }

    #[test]
    fn test_row_window_saturates() {
        let (from, to) = row_window(u64::MAX / 2, u64::MAX, 3);
        assert_eq!(from, u64::MAX);
        assert_eq!(to, u64::MAX);
    }
}
