//! Configuration structures for zeno.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`ServerConfig`]: HTTP listener, request timeout and preflight switches
//! - [`EngineConfig`]: Wasmtime engine settings for plugin guests
//! - [`ExecutionConfig`]: Per-call guest limits (fuel, memory, timeout)
//! - [`PluginConfig`], [`WorkerConfig`], [`DatabaseConfig`], [`AdminConfig`]
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (see [`crate::config_file`]), then environment variables via
//! [`RuntimeConfig::apply_env`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call guest execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Plugin host configuration.
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// User database connections.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address. A bare `:port` binds all interfaces.
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// Application environment; `production` selects JSON logs.
    #[serde(default = "defaults::app_env")]
    pub app_env: String,

    /// Per-request deadline in milliseconds.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum accepted form body size in bytes.
    #[serde(default = "defaults::max_form_bytes")]
    pub max_form_bytes: usize,

    /// Seconds to wait for in-flight requests on shutdown.
    #[serde(default = "defaults::graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,

    /// Skip the preflight static analysis.
    #[serde(default)]
    pub skip_validation: bool,

    /// Development live-reload toggle.
    #[serde(default)]
    pub live_reload: bool,

    /// Compile route bodies to bytecode when the subset allows.
    #[serde(default)]
    pub use_vm: bool,

    /// Shared secret for the native JWT auth middleware.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            app_env: defaults::app_env(),
            request_timeout_ms: defaults::request_timeout_ms(),
            max_form_bytes: defaults::max_form_bytes(),
            graceful_shutdown_secs: defaults::graceful_shutdown_secs(),
            skip_validation: false,
            live_reload: false,
            use_vm: false,
            jwt_secret: None,
        }
    }
}

impl ServerConfig {
    /// Get the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Socket address to bind, expanding `:port` to `0.0.0.0:port`.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }

    /// Returns `true` when running with the production profile.
    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and compilation caching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for guest instances.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable caching of compiled modules on disk.
    #[serde(default)]
    pub cache_compiled_modules: bool,

    /// Wasmtime cache config file; the user default when unset.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Enable epoch-based interruption of guest code.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cache_compiled_modules: false,
            cache_dir: None,
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-call guest execution configuration.
///
/// These settings control resource limits for individual plugin calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per guest call.
    ///
    /// Fuel metering provides deterministic CPU limiting.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Guest call timeout in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Outbound HTTP requests a guest may make per call.
    #[serde(default = "defaults::max_http_requests")]
    pub max_http_requests: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
            max_http_requests: defaults::max_http_requests(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Plugin host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Enable the plugin host.
    #[serde(default)]
    pub enabled: bool,

    /// Root directory; one subdirectory per plugin.
    #[serde(default = "defaults::plugin_dir")]
    pub dir: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: defaults::plugin_dir(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Start the worker pool alongside the server.
    #[serde(default)]
    pub enabled: bool,

    /// Number of concurrent worker loops.
    #[serde(default = "defaults::worker_concurrency")]
    pub concurrency: usize,

    /// Queue names the pool subscribes to.
    #[serde(default = "defaults::worker_queues")]
    pub queues: Vec<String>,

    /// SQLite file backing the queue.
    #[serde(default = "defaults::queue_db")]
    pub queue_db: String,

    /// Sleep between empty claims in milliseconds.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Visibility timeout of a claimed job in seconds.
    #[serde(default = "defaults::lease_secs")]
    pub lease_secs: u64,

    /// Attempts after which a job moves to `failed`.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed job becomes visible again, in seconds.
    #[serde(default = "defaults::retry_after_secs")]
    pub retry_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: defaults::worker_concurrency(),
            queues: defaults::worker_queues(),
            queue_db: defaults::queue_db(),
            poll_interval_ms: defaults::poll_interval_ms(),
            lease_secs: defaults::lease_secs(),
            max_attempts: defaults::max_attempts(),
            retry_after_secs: defaults::retry_after_secs(),
        }
    }
}

impl WorkerConfig {
    /// Get the poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the lease as a `Duration`.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// One database connection description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// `sqlite`, `postgres` or `mysql`.
    pub driver: String,
    /// Host, optionally with `:port`.
    #[serde(default)]
    pub host: String,
    /// Database name, or file path for SQLite.
    #[serde(default)]
    pub name: String,
    /// User name.
    #[serde(default)]
    pub user: String,
    /// Password.
    #[serde(default)]
    pub pass: String,
}

impl ConnectionConfig {
    /// Build a connection URL for the configured driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unknown drivers.
    pub fn url(&self) -> Result<String, RuntimeError> {
        match self.driver.as_str() {
            "sqlite" | "sqlite3" => {
                if self.name.is_empty() || self.name == ":memory:" {
                    Ok("sqlite::memory:".to_string())
                } else if self.name.starts_with("sqlite:") {
                    Ok(self.name.clone())
                } else {
                    Ok(format!("sqlite://{}?mode=rwc", self.name))
                }
            }
            "postgres" | "postgresql" | "pgsql" => Ok(format!(
                "postgres://{}@{}/{}",
                self.credentials(),
                self.host_or_default("localhost:5432"),
                self.name
            )),
            "mysql" | "mariadb" => Ok(format!(
                "mysql://{}@{}/{}",
                self.credentials(),
                self.host_or_default("localhost:3306"),
                self.name
            )),
            other => Err(RuntimeError::invalid_config(format!(
                "unsupported database driver '{other}'"
            ))),
        }
    }

    fn credentials(&self) -> String {
        if self.pass.is_empty() {
            self.user.clone()
        } else {
            format!("{}:{}", self.user, self.pass)
        }
    }

    fn host_or_default<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.host.is_empty() {
            fallback
        } else {
            &self.host
        }
    }
}

/// User database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// The `default` connection.
    #[serde(default)]
    pub primary: Option<ConnectionConfig>,

    /// Additional connections keyed by lower-case name.
    #[serde(default)]
    pub named: BTreeMap<String, ConnectionConfig>,

    /// Maximum pool size per connection.
    #[serde(default = "defaults::max_open_conns")]
    pub max_open_conns: u32,

    /// Minimum idle connections per pool.
    #[serde(default = "defaults::max_idle_conns")]
    pub max_idle_conns: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary: None,
            named: BTreeMap::new(),
            max_open_conns: defaults::max_open_conns(),
            max_idle_conns: defaults::max_idle_conns(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable Admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Check if Admin API is properly configured.
    ///
    /// Returns `true` if enabled and token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

impl RuntimeConfig {
    /// Overlay the process environment onto this configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a variable holds an unparsable value.
    pub fn apply_process_env(&mut self) -> Result<(), RuntimeError> {
        self.apply_env(std::env::vars())
    }

    /// Overlay environment variables onto this configuration.
    ///
    /// Variables that are absent leave the current value untouched.
    ///
    /// # Arguments
    ///
    /// * `vars` - `(name, value)` pairs, usually `std::env::vars()`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a variable holds an unparsable value.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), RuntimeError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| env.get(key).map(String::as_str);

        if let Some(port) = get("APP_PORT") {
            self.server.listen = if port.contains(':') {
                port.to_string()
            } else {
                format!(":{port}")
            };
        }
        if let Some(app_env) = get("APP_ENV") {
            self.server.app_env = app_env.to_string();
        }
        if let Some(timeout) = get("ZENO_REQUEST_TIMEOUT") {
            let parsed = parse_duration(timeout).map_err(|e| {
                RuntimeError::invalid_config(format!("ZENO_REQUEST_TIMEOUT: {e}"))
            })?;
            self.server.request_timeout_ms = u64::try_from(parsed.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(v) = get("ZENO_SKIP_VALIDATION") {
            self.server.skip_validation = parse_bool(v);
        }
        if let Some(v) = get("LIVERELOAD_ENABLED") {
            self.server.live_reload = parse_bool(v);
        }
        if let Some(v) = get("ZENO_USE_VM") {
            self.server.use_vm = parse_bool(v);
        }
        if let Some(v) = get("JWT_SECRET") {
            self.server.jwt_secret = Some(v.to_string());
        }
        if let Some(v) = get("ZENO_MAX_FORM_BYTES") {
            self.server.max_form_bytes = parse_number("ZENO_MAX_FORM_BYTES", v)?;
        }

        if let Some(v) = get("ZENO_PLUGINS_ENABLED") {
            self.plugins.enabled = parse_bool(v);
        }
        if let Some(v) = get("ZENO_PLUGIN_DIR") {
            self.plugins.dir = v.to_string();
        }

        if let Some(v) = get("WORKER_ENABLED") {
            self.worker.enabled = parse_bool(v);
        }
        if let Some(v) = get("WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_number("WORKER_CONCURRENCY", v)?;
        }
        if let Some(v) = get("WORKER_QUEUES") {
            self.worker.queues = v
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("ZENO_QUEUE_DB") {
            self.worker.queue_db = v.to_string();
        }

        if let Some(token) = get("ZENO_ADMIN_TOKEN") {
            self.admin.enabled = true;
            self.admin.token = Some(token.to_string());
        }

        if let Some(v) = get("DB_MAX_OPEN_CONNS") {
            self.database.max_open_conns = parse_number("DB_MAX_OPEN_CONNS", v)?;
        }
        if let Some(v) = get("DB_MAX_IDLE_CONNS") {
            self.database.max_idle_conns = parse_number("DB_MAX_IDLE_CONNS", v)?;
        }
        if let Some(primary) = connection_from_env(&env, "DB") {
            self.database.primary = Some(primary);
        }

        // DB_<NAME>_DRIVER marks a named connection.
        for key in env.keys() {
            let Some(name) = key
                .strip_prefix("DB_")
                .and_then(|rest| rest.strip_suffix("_DRIVER"))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if let Some(conn) = connection_from_env(&env, &format!("DB_{name}")) {
                self.database.named.insert(name.to_ascii_lowercase(), conn);
            }
        }

        Ok(())
    }
}

fn connection_from_env(env: &HashMap<String, String>, prefix: &str) -> Option<ConnectionConfig> {
    let field = |suffix: &str| {
        env.get(&format!("{prefix}_{suffix}"))
            .cloned()
            .unwrap_or_default()
    };
    let driver = field("DRIVER");
    if driver.is_empty() {
        return None;
    }
    Some(ConnectionConfig {
        driver: driver.to_ascii_lowercase(),
        host: field("HOST"),
        name: field("NAME"),
        user: field("USER"),
        pass: field("PASS"),
    })
}

/// Parse a boolean flag; `true`, `1`, `yes` and `on` are truthy.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, RuntimeError> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::invalid_config(format!("{key}: '{value}' is not a number")))
}

/// Parse a duration such as `100ms`, `30s`, `2m`, `1h` or a bare number of seconds.
///
/// # Errors
///
/// Returns a description of the problem for malformed input.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    if number.is_empty() {
        return Err(format!("'{value}' has no numeric part"));
    }
    let amount: f64 = number
        .parse()
        .map_err(|_| format!("'{value}' is not a valid duration"))?;

    let millis = match unit.trim() {
        "ms" => amount,
        "" | "s" => amount * 1_000.0,
        "m" => amount * 60_000.0,
        "h" => amount * 3_600_000.0,
        other => return Err(format!("unknown duration unit '{other}'")),
    };

    Ok(Duration::from_millis(millis.round() as u64))
}

/// Default value functions for serde.
mod defaults {
    pub fn listen() -> String {
        ":3000".to_string()
    }

    pub fn app_env() -> String {
        "development".to_string()
    }

    pub const fn request_timeout_ms() -> u64 {
        30_000
    }

    pub const fn max_form_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub const fn graceful_shutdown_secs() -> u64 {
        5
    }

    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn max_http_requests() -> u32 {
        10
    }

    pub fn plugin_dir() -> String {
        "./plugins".to_string()
    }

    pub const fn worker_concurrency() -> usize {
        1
    }

    pub fn worker_queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    pub fn queue_db() -> String {
        "zeno_internal.db".to_string()
    }

    pub const fn poll_interval_ms() -> u64 {
        1_000
    }

    pub const fn lease_secs() -> u64 {
        30
    }

    pub const fn max_attempts() -> u32 {
        5
    }

    pub const fn retry_after_secs() -> u64 {
        10
    }

    pub const fn max_open_conns() -> u32 {
        10
    }

    pub const fn max_idle_conns() -> u32 {
        0
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }
}
