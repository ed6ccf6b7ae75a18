//! Host functions offered to plugin guests.
//!
//! Each operation consults the plugin's [`Permissions`] before touching
//! anything and answers with an [`Envelope`]. A denied operation performs
//! no I/O.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use tracing::debug;
use zeno_common::{HostFunctionError, RuntimeError};
use zeno_core::scope::is_reserved;
use zeno_core::{Value, ValueMap};
use zeno_db::{DEFAULT_CONNECTION, DatabaseManager, Executor, Statement};

use crate::Permissions;
use crate::http_outbound::{HttpOutboundHost, HttpRequest};

/// Tagged reply of every host function and of every guest call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(data: Json) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    fn from_result(result: Result<Json, HostFunctionError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Variables visible to the current guest call and the writes it made.
#[derive(Debug, Default)]
struct CallScope {
    values: ValueMap,
    writes: ValueMap,
}

/// Per-plugin host state reachable from guest host functions.
///
/// Cloning is cheap; clones share the per-call scope.
#[derive(Clone)]
pub struct HostContext {
    pub plugin: Arc<str>,
    pub permissions: Arc<Permissions>,
    /// Plugin directory; filesystem paths are resolved against it.
    pub root: Arc<PathBuf>,
    pub databases: Option<Arc<DatabaseManager>>,
    pub http: Arc<HttpOutboundHost>,
    call: Arc<Mutex<CallScope>>,
}

#[derive(Deserialize)]
struct DbQuery {
    #[serde(default)]
    connection: Option<String>,
    sql: String,
    #[serde(default)]
    bindings: Vec<Json>,
}

#[derive(Deserialize)]
struct ScopeWrite {
    key: String,
    value: Json,
}

#[derive(Deserialize)]
struct FileWrite {
    path: String,
    content: String,
}

impl HostContext {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the HTTP client cannot be built.
    pub fn new(
        plugin: &str,
        permissions: Permissions,
        root: PathBuf,
        databases: Option<Arc<DatabaseManager>>,
    ) -> Result<Self, RuntimeError> {
        let permissions = Arc::new(permissions);
        let http = HttpOutboundHost::new(permissions.clone())?;
        Ok(Self {
            plugin: Arc::from(plugin),
            permissions,
            root: Arc::new(root),
            databases,
            http: Arc::new(http),
            call: Arc::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(plugin: &str) -> Self {
        let permissions = Arc::new(Permissions::none());
        Self {
            plugin: Arc::from(plugin),
            http: Arc::new(HttpOutboundHost::with_client(
                reqwest::Client::new(),
                permissions.clone(),
            )),
            permissions,
            root: Arc::new(PathBuf::from(".")),
            databases: None,
            call: Arc::default(),
        }
    }

    /// Install the scope snapshot for a new guest call.
    pub fn begin_call(&self, values: ValueMap) {
        let mut call = self.call.lock();
        call.values = values;
        call.writes.clear();
        self.http.reset_count();
    }

    /// Scope writes made during the current call.
    pub fn take_writes(&self) -> ValueMap {
        std::mem::take(&mut self.call.lock().writes)
    }

    pub async fn db_query(self, input: Vec<u8>) -> Envelope {
        Envelope::from_result(self.run_db_query(&input).await)
    }

    async fn run_db_query(&self, input: &[u8]) -> Result<Json, HostFunctionError> {
        let request: DbQuery = parse(input)?;
        let connection = request.connection.as_deref().unwrap_or(DEFAULT_CONNECTION);
        self.permissions.check_database(connection)?;

        let Some(databases) = &self.databases else {
            return Err(backend("db_query", "no databases configured"));
        };
        let executor = databases
            .get(Some(connection))
            .map(Executor::Pool)
            .map_err(|e| backend("db_query", e))?;
        let stmt = Statement {
            sql: request.sql,
            args: request.bindings.into_iter().map(Value::from_json).collect(),
        };
        debug!(plugin = %self.plugin, db = connection, "guest query");

        if returns_rows(&stmt.sql) {
            let rows = executor
                .fetch_all(&stmt)
                .await
                .map_err(|e| backend("db_query", e))?;
            let rows: Vec<Json> = rows
                .into_iter()
                .map(|row| Value::Map(row).to_json())
                .collect();
            Ok(json!({ "rows": rows }))
        } else {
            let result = executor
                .execute(&stmt)
                .await
                .map_err(|e| backend("db_query", e))?;
            Ok(json!({
                "rows_affected": result.rows_affected,
                "last_insert_id": result.last_insert_id,
            }))
        }
    }

    pub async fn http_request(self, input: Vec<u8>) -> Envelope {
        let result = match parse::<HttpRequest>(&input) {
            Ok(request) => self
                .http
                .fetch(request)
                .await
                .map(|response| {
                    json!({
                        "status": response.status,
                        "headers": response.headers,
                        "body": String::from_utf8_lossy(&response.body),
                    })
                })
                .map_err(HostFunctionError::from),
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    pub async fn scope_get(self, input: Vec<u8>) -> Envelope {
        Envelope::from_result(self.read_scope(&input))
    }

    fn read_scope(&self, input: &[u8]) -> Result<Json, HostFunctionError> {
        self.permissions.check_scope_read()?;
        let key = text(input)?;
        let call = self.call.lock();
        let value = call
            .writes
            .get(key)
            .or_else(|| call.values.get(key))
            .map_or(Json::Null, Value::to_json);
        Ok(json!({ "value": value }))
    }

    pub async fn scope_set(self, input: Vec<u8>) -> Envelope {
        Envelope::from_result(self.write_scope(&input))
    }

    fn write_scope(&self, input: &[u8]) -> Result<Json, HostFunctionError> {
        self.permissions.check_scope_write()?;
        let write: ScopeWrite = parse(input)?;
        if write.key.is_empty() || is_reserved(&write.key) {
            return Err(HostFunctionError::InvalidArgument {
                reason: format!("'{}' is not a writable variable", write.key),
            });
        }
        self.call
            .lock()
            .writes
            .insert(write.key, Value::from_json(write.value));
        Ok(json!({}))
    }

    pub async fn file_read(self, input: Vec<u8>) -> Envelope {
        Envelope::from_result(self.read_file(&input).await)
    }

    async fn read_file(&self, input: &[u8]) -> Result<Json, HostFunctionError> {
        let relative = self.permissions.check_path(text(input)?, "read")?;
        let path = self.root.join(relative);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| backend("file_read", e))?;
        Ok(json!({ "content": content }))
    }

    pub async fn file_write(self, input: Vec<u8>) -> Envelope {
        Envelope::from_result(self.write_file(&input).await)
    }

    async fn write_file(&self, input: &[u8]) -> Result<Json, HostFunctionError> {
        let request: FileWrite = parse(input)?;
        let relative = self.permissions.check_path(&request.path, "write")?;
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| backend("file_write", e))?;
        }
        tokio::fs::write(&path, request.content.as_bytes())
            .await
            .map_err(|e| backend("file_write", e))?;
        Ok(json!({ "bytes": request.content.len() }))
    }

    pub async fn env_get(self, input: Vec<u8>) -> Envelope {
        let result = text(&input).and_then(|name| {
            self.permissions.check_env(name)?;
            Ok(json!({ "value": std::env::var(name).ok() }))
        });
        Envelope::from_result(result)
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin", &self.plugin)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_lowercase();
    head.starts_with("select")
        || head.starts_with("with")
        || head.starts_with("pragma")
        || head.contains(" returning ")
}

fn parse<T: DeserializeOwned>(input: &[u8]) -> Result<T, HostFunctionError> {
    serde_json::from_slice(input).map_err(|e| HostFunctionError::InvalidArgument {
        reason: format!("malformed request: {e}"),
    })
}

fn text(input: &[u8]) -> Result<&str, HostFunctionError> {
    std::str::from_utf8(input).map_err(|_| HostFunctionError::InvalidArgument {
        reason: "argument is not UTF-8".into(),
    })
}

fn backend(operation: &str, reason: impl std::fmt::Display) -> HostFunctionError {
    HostFunctionError::Backend {
        operation: operation.into(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPermissions;

    fn context(permissions: ManifestPermissions, root: PathBuf) -> HostContext {
        HostContext::new("test", Permissions::from_manifest(&permissions, 4), root, None).unwrap()
    }

    #[tokio::test]
    async fn test_file_read_denied_without_permission() {
        let ctx = context(ManifestPermissions::default(), PathBuf::from("/"));
        let reply = ctx.file_read(b"/etc/passwd".to_vec()).await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().to_lowercase().contains("permission"));
    }

    #[tokio::test]
    async fn test_file_round_trip_inside_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            ManifestPermissions {
                filesystem: vec!["data".into()],
                ..Default::default()
            },
            dir.path().to_path_buf(),
        );

        let write = ctx
            .clone()
            .file_write(br#"{"path": "data/notes/a.txt", "content": "hello"}"#.to_vec())
            .await;
        assert!(write.success, "{write:?}");
        assert!(dir.path().join("data/notes/a.txt").is_file());

        let read = ctx.clone().file_read(b"data/notes/a.txt".to_vec()).await;
        assert_eq!(read.data.unwrap()["content"], "hello");

        let escape = ctx.file_read(b"data/../../secret".to_vec()).await;
        assert!(!escape.success);
    }

    #[tokio::test]
    async fn test_scope_read_and_write() {
        let ctx = context(
            ManifestPermissions {
                scope: vec!["read".into(), "write".into()],
                ..Default::default()
            },
            PathBuf::from("."),
        );
        let mut values = ValueMap::new();
        values.insert("user".into(), Value::from("ada"));
        ctx.begin_call(values);

        let read = ctx.clone().scope_get(b"user".to_vec()).await;
        assert_eq!(read.data.unwrap()["value"], "ada");

        let write = ctx
            .clone()
            .scope_set(br#"{"key": "greeting", "value": "hi"}"#.to_vec())
            .await;
        assert!(write.success);
        let reserved = ctx
            .clone()
            .scope_set(br#"{"key": "_active_tx", "value": 1}"#.to_vec())
            .await;
        assert!(!reserved.success);

        let writes = ctx.take_writes();
        assert_eq!(writes.get("greeting"), Some(&Value::from("hi")));
        assert!(ctx.take_writes().is_empty());
    }

    #[tokio::test]
    async fn test_scope_denied_without_capability() {
        let ctx = context(ManifestPermissions::default(), PathBuf::from("."));
        let read = ctx.clone().scope_get(b"user".to_vec()).await;
        assert!(!read.success);
        let write = ctx.scope_set(br#"{"key": "x", "value": 1}"#.to_vec()).await;
        assert!(!write.success);
    }

    #[tokio::test]
    async fn test_env_get_is_gated() {
        let ctx = context(
            ManifestPermissions {
                env: vec!["PATH".into()],
                ..Default::default()
            },
            PathBuf::from("."),
        );
        let allowed = ctx.clone().env_get(b"PATH".to_vec()).await;
        assert!(allowed.success);
        let denied = ctx.env_get(b"HOME".to_vec()).await;
        assert!(!denied.success);
    }

    #[tokio::test]
    async fn test_db_query_requires_listed_connection() {
        let databases = Arc::new(DatabaseManager::new());
        databases.connect("default", "sqlite::memory:").await.unwrap();
        let permissions = Permissions::from_manifest(
            &ManifestPermissions {
                database: vec!["default".into()],
                ..Default::default()
            },
            4,
        );
        let ctx = HostContext::new("db", permissions, PathBuf::from("."), Some(databases)).unwrap();

        let create = ctx
            .clone()
            .db_query(br#"{"sql": "CREATE TABLE t (id INTEGER)"}"#.to_vec())
            .await;
        assert!(create.success, "{create:?}");
        let insert = ctx
            .clone()
            .db_query(br#"{"sql": "INSERT INTO t (id) VALUES (?)", "bindings": [7]}"#.to_vec())
            .await;
        assert_eq!(insert.data.unwrap()["rows_affected"], 1);
        let select = ctx
            .clone()
            .db_query(br#"{"sql": "SELECT id FROM t"}"#.to_vec())
            .await;
        assert_eq!(select.data.unwrap()["rows"][0]["id"], 7);

        let other = ctx
            .db_query(br#"{"connection": "billing", "sql": "SELECT 1"}"#.to_vec())
            .await;
        assert!(other.error.unwrap().contains("Permission denied"));
    }

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(Envelope::ok(json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": {"a": 1}}));
        let failed: Envelope = serde_json::from_str(r#"{"success": false, "error": "nope"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("nope"));
    }
}
