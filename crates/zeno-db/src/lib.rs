//! # zeno-db
//!
//! Portable SQL for zeno programs: a fluent query builder rendered per
//! dialect, named connection pools over `sqlx::Any`, and transactions that
//! pin one connection for the duration of a `db.transaction` body.

pub mod dialect;
pub mod executor;
pub mod manager;
pub mod query;
pub mod slots;

pub use dialect::{Dialect, MySql, Postgres, Sqlite, dialect_for};
pub use executor::{ExecResult, Executor, TxHandle, active_transaction};
pub use manager::{Connection, DEFAULT_CONNECTION, DatabaseManager};
pub use query::{Conjunction, Join, JoinKind, Op, QueryState, Statement};
pub use slots::register;
