//! Named connection pools.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::AnyPool;
use zeno_common::{DatabaseConfig, RuntimeError};

use crate::dialect::{Dialect, dialect_for};

/// Name of the connection used when a slot does not pick one.
pub const DEFAULT_CONNECTION: &str = "default";

/// A pool together with the dialect spoken over it.
#[derive(Debug, Clone)]
pub struct Connection {
    pub name: String,
    pub pool: AnyPool,
    pub dialect: Arc<dyn Dialect>,
}

/// Registry of the user databases a program can reach.
#[derive(Debug)]
pub struct DatabaseManager {
    connections: DashMap<String, Connection>,
    max_open: u32,
    min_idle: u32,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            max_open: 10,
            min_idle: 0,
        }
    }

    /// Connect every database in `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown driver and `Database` when a
    /// pool cannot be opened.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, RuntimeError> {
        let manager = Self {
            connections: DashMap::new(),
            max_open: config.max_open_conns.max(1),
            min_idle: config.max_idle_conns,
        };
        if let Some(primary) = &config.primary {
            manager.connect(DEFAULT_CONNECTION, &primary.url()?).await?;
        }
        for (name, connection) in &config.named {
            manager.connect(name, &connection.url()?).await?;
        }
        Ok(manager)
    }

    /// Open (or replace) the pool registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the pool cannot be opened.
    pub async fn connect(&self, name: &str, url: &str) -> Result<Connection, RuntimeError> {
        install_default_drivers();
        let dialect = dialect_for(url)?;

        let mut options = AnyPoolOptions::new()
            .max_connections(self.max_open)
            .min_connections(self.min_idle.min(self.max_open))
            .acquire_timeout(Duration::from_secs(30));
        if url.contains(":memory:") {
            // Every connection to `:memory:` is its own database: keep exactly one alive.
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options
            .connect(url)
            .await
            .map_err(|e| RuntimeError::database(format!("connect '{name}'"), e))?;

        tracing::info!(db = %name, dialect = dialect.name(), "database connected");
        let connection = Connection {
            name: name.to_string(),
            pool,
            dialect,
        };
        self.connections
            .insert(name.to_string(), connection.clone());
        Ok(connection)
    }

    /// The connection registered as `name` (`None` for the default).
    ///
    /// # Errors
    ///
    /// Returns `Database` when no such connection exists.
    pub fn get(&self, name: Option<&str>) -> Result<Connection, RuntimeError> {
        let name = name.unwrap_or(DEFAULT_CONNECTION);
        self.connections
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                RuntimeError::database("resolve connection", format!("unknown database '{name}'"))
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Close every pool.
    pub async fn close(&self) {
        let pools: Vec<AnyPool> = self.connections.iter().map(|c| c.pool.clone()).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

impl Default for DatabaseManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_resolve_default() {
        let manager = DatabaseManager::new();
        manager
            .connect(DEFAULT_CONNECTION, "sqlite::memory:")
            .await
            .unwrap();

        let conn = manager.get(None).unwrap();
        assert_eq!(conn.dialect.name(), "sqlite");
        assert_eq!(manager.names(), vec!["default".to_string()]);
        assert!(manager.get(Some("reports")).is_err());
    }
}
