//! SQL dialects.
//!
//! A dialect knows how to quote identifiers, number placeholders and spell
//! `LIMIT`/`OFFSET`. Everything else the builder renders is portable.

use std::fmt;
use std::sync::Arc;

use zeno_common::RuntimeError;

/// Dialect-specific SQL spelling.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// `sqlite`, `postgres` or `mysql`; drives feature switches such as
    /// `RETURNING`.
    fn name(&self) -> &'static str;

    /// Quote one identifier segment.
    fn quote_ident(&self, ident: &str) -> String;

    /// Placeholder for the 1-based argument `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Trailing `LIMIT`/`OFFSET` clause, with a leading space, or empty.
    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String;

    /// Quote a possibly qualified identifier (`users.id`); `*` is kept.
    fn quote(&self, ident: &str) -> String {
        ident
            .split('.')
            .map(|part| {
                if part == "*" {
                    part.to_string()
                } else {
                    self.quote_ident(part)
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Whether `INSERT` can return the generated key with `RETURNING`.
    fn supports_returning(&self) -> bool {
        self.name() == "postgres"
    }
}

fn wrap(ident: &str, quote: char) -> String {
    let escaped = ident.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_ident(&self, ident: &str) -> String {
        wrap(ident, '"')
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".into()
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
            (Some(l), None) => format!(" LIMIT {l}"),
            (None, Some(o)) => format!(" LIMIT -1 OFFSET {o}"),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, ident: &str) -> String {
        wrap(ident, '"')
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut out = String::new();
        if let Some(l) = limit {
            out.push_str(&format!(" LIMIT {l}"));
        }
        if let Some(o) = offset {
            out.push_str(&format!(" OFFSET {o}"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        wrap(ident, '`')
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".into()
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
            (Some(l), None) => format!(" LIMIT {l}"),
            // MySQL has no OFFSET without LIMIT.
            (None, Some(o)) => format!(" LIMIT 18446744073709551615 OFFSET {o}"),
            (None, None) => String::new(),
        }
    }
}

/// Dialect for a driver name or connection URL scheme.
///
/// # Errors
///
/// Returns `InvalidConfig` for unknown drivers.
pub fn dialect_for(driver: &str) -> Result<Arc<dyn Dialect>, RuntimeError> {
    let scheme = driver.split(':').next().unwrap_or(driver);
    match scheme.to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => Ok(Arc::new(Sqlite)),
        "postgres" | "postgresql" | "pgsql" => Ok(Arc::new(Postgres)),
        "mysql" | "mariadb" => Ok(Arc::new(MySql)),
        other => Err(RuntimeError::invalid_config(format!(
            "unsupported database driver '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting_per_dialect() {
        assert_eq!(MySql.quote("users.id"), "`users`.`id`");
        assert_eq!(Sqlite.quote("users.*"), "\"users\".*");
        assert_eq!(Postgres.quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_placeholders_and_limits() {
        assert_eq!(Postgres.placeholder(3), "$3");
        assert_eq!(MySql.placeholder(3), "?");
        assert_eq!(Sqlite.limit_offset(None, Some(5)), " LIMIT -1 OFFSET 5");
        assert_eq!(Postgres.limit_offset(None, Some(5)), " OFFSET 5");
        assert_eq!(MySql.limit_offset(Some(10), None), " LIMIT 10");
    }

    #[test]
    fn test_dialect_from_url_scheme() {
        assert_eq!(dialect_for("sqlite::memory:").unwrap().name(), "sqlite");
        assert_eq!(dialect_for("postgres://u@h/db").unwrap().name(), "postgres");
        assert!(dialect_for("oracle").is_err());
    }
}
