//! Statement execution against a pool or a pinned transaction.

use std::fmt;
use std::sync::Arc;

use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Column, Row, Transaction};
use tokio::sync::Mutex;
use zeno_common::RuntimeError;
use zeno_core::scope::ACTIVE_TX_KEY;
use zeno_core::{Opaque, Scope, Value, ValueMap};

use crate::dialect::Dialect;
use crate::manager::{Connection, DatabaseManager};
use crate::query::Statement;

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// A transaction pinned to one pooled connection until commit or rollback.
pub struct TxHandle {
    name: String,
    dialect: Arc<dyn Dialect>,
    tx: Mutex<Option<Transaction<'static, Any>>>,
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("name", &self.name)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl TxHandle {
    /// Begin a transaction on `connection`.
    ///
    /// # Errors
    ///
    /// Returns `Database` when no connection can be acquired.
    pub async fn begin(connection: &Connection) -> Result<Self, RuntimeError> {
        let tx = connection
            .pool
            .begin()
            .await
            .map_err(|e| RuntimeError::database("begin transaction", e))?;
        Ok(Self {
            name: connection.name.clone(),
            dialect: Arc::clone(&connection.dialect),
            tx: Mutex::new(Some(tx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commit; later statements on this handle fail.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the commit fails or the handle is finished.
    pub async fn commit(&self) -> Result<(), RuntimeError> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.commit()
            .await
            .map_err(|e| RuntimeError::database("commit", e))
    }

    /// Roll back; later statements on this handle fail.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the rollback fails or the handle is finished.
    pub async fn rollback(&self) -> Result<(), RuntimeError> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.rollback()
            .await
            .map_err(|e| RuntimeError::database("rollback", e))
    }
}

fn finished() -> RuntimeError {
    RuntimeError::database("transaction", "transaction already finished")
}

/// The transaction installed in `scope`, if any.
pub fn active_transaction(scope: &Scope) -> Option<Arc<TxHandle>> {
    scope
        .get(ACTIVE_TX_KEY)
        .and_then(|v| v.as_opaque().and_then(Opaque::downcast::<TxHandle>))
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Where statements go: the active transaction or a pool.
#[derive(Debug, Clone)]
pub enum Executor {
    Pool(Connection),
    Tx(Arc<TxHandle>),
}

impl Executor {
    /// Prefer the active transaction in `scope`; otherwise look the
    /// connection up by name.
    ///
    /// # Errors
    ///
    /// Returns `Database` for an unknown connection name.
    pub fn resolve(
        manager: &DatabaseManager,
        scope: &Scope,
        db: Option<&str>,
    ) -> Result<Self, RuntimeError> {
        if let Some(tx) = active_transaction(scope) {
            if db.is_none_or(|name| name == tx.name()) {
                return Ok(Self::Tx(tx));
            }
        }
        manager.get(db).map(Self::Pool)
    }

    pub fn dialect(&self) -> &dyn Dialect {
        match self {
            Self::Pool(c) => c.dialect.as_ref(),
            Self::Tx(tx) => tx.dialect.as_ref(),
        }
    }

    /// Run a query and decode every row.
    ///
    /// # Errors
    ///
    /// Returns `Database` on driver failure.
    pub async fn fetch_all(&self, stmt: &Statement) -> Result<Vec<ValueMap>, RuntimeError> {
        tracing::debug!(sql = %stmt.sql, args = stmt.args.len(), "query");
        let query = build(stmt)?;
        let rows = match self {
            Self::Pool(c) => query.fetch_all(&c.pool).await,
            Self::Tx(handle) => {
                let mut guard = handle.tx.lock().await;
                let tx = guard.as_mut().ok_or_else(finished)?;
                query.fetch_all(&mut **tx).await
            }
        }
        .map_err(|e| RuntimeError::database("query", e))?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    /// Run a statement that returns no rows.
    ///
    /// # Errors
    ///
    /// Returns `Database` on driver failure.
    pub async fn execute(&self, stmt: &Statement) -> Result<ExecResult, RuntimeError> {
        tracing::debug!(sql = %stmt.sql, args = stmt.args.len(), "execute");
        let query = build(stmt)?;
        let result = match self {
            Self::Pool(c) => query.execute(&c.pool).await,
            Self::Tx(handle) => {
                let mut guard = handle.tx.lock().await;
                let tx = guard.as_mut().ok_or_else(finished)?;
                query.execute(&mut **tx).await
            }
        }
        .map_err(|e| RuntimeError::database("execute", e))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    /// First column of the first row, `Nil` when there is none.
    ///
    /// # Errors
    ///
    /// Returns `Database` on driver failure.
    pub async fn scalar(&self, stmt: &Statement) -> Result<Value, RuntimeError> {
        let rows = self.fetch_all(stmt).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v))
            .unwrap_or_default())
    }
}

fn build(stmt: &Statement) -> Result<AnyQuery<'_>, RuntimeError> {
    let mut query = sqlx::query(&stmt.sql);
    for value in &stmt.args {
        query = match value {
            Value::Nil => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::String(s) => query.bind(s.clone()),
            Value::List(_) | Value::Map(_) => query.bind(value.to_json().to_string()),
            Value::Opaque(_) => {
                return Err(RuntimeError::database(
                    "bind",
                    "native objects cannot be bound as SQL arguments",
                ));
            }
        };
    }
    Ok(query)
}

fn row_to_map(row: &AnyRow) -> ValueMap {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| (column.name().to_string(), decode(row, i)))
        .collect()
}

fn decode(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Nil, Value::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Nil, Value::Float);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Value::Nil, Value::Bool);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Nil, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Nil, |bytes| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
    }
    Value::Nil
}
