//! Shared application state.
//!
//! [`AppState`] owns everything the HTTP surface shares across requests:
//! the engine, the request pipeline, the hot router and the middleware
//! registry. Route tables are built here, off the request path, and then
//! swapped into the [`HotRouter`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument, warn};
use zeno_common::{RuntimeError, ServerConfig};
use zeno_core::context::ROUTER;
use zeno_core::{Analyzer, ArenaPool, Context, Engine, Node, PoolStats, Scope};
use zeno_plugin::PluginManager;

use crate::handler::{Pipeline, PipelineSettings};
use crate::livereload::LiveReload;
use crate::middleware::MiddlewareRegistry;
use crate::router::{HotRouter, RouteCollector};

/// How route tables are built.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Compile route bodies to bytecode when they fit the VM subset.
    pub use_vm: bool,
    /// Skip preflight analysis.
    pub skip_validation: bool,
}

/// Readiness snapshot for `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyStatus {
    pub routes: usize,
    pub plugins: usize,
    pub arenas: PoolStats,
}

/// Shared state across all request handlers.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    pipeline: Arc<Pipeline>,
    hot: Arc<HotRouter>,
    middleware: Arc<MiddlewareRegistry>,
    plugins: Option<Arc<PluginManager>>,
    live: Option<Arc<LiveReload>>,
    program: Arc<RwLock<Option<PathBuf>>>,
    rebuild: Arc<tokio::sync::Mutex<()>>,
    options: BuildOptions,
}

impl AppState {
    /// Create state around `engine` and register the HTTP slots on it.
    pub fn new(
        engine: Engine,
        middleware: Arc<MiddlewareRegistry>,
        settings: PipelineSettings,
        options: BuildOptions,
    ) -> Self {
        crate::slots::register(&engine, &middleware);
        let pipeline = Arc::new(Pipeline::new(
            engine.clone(),
            ArenaPool::new(),
            Arc::clone(&middleware),
            settings,
        ));
        Self {
            engine,
            pipeline,
            hot: Arc::new(HotRouter::new()),
            middleware,
            plugins: None,
            live: None,
            program: Arc::new(RwLock::new(None)),
            rebuild: Arc::new(tokio::sync::Mutex::new(())),
            options,
        }
    }

    /// State configured from the `[server]` section.
    pub fn from_config(engine: Engine, config: &ServerConfig) -> Self {
        let middleware = Arc::new(MiddlewareRegistry::with_jwt_secret(
            config.jwt_secret.as_deref(),
        ));
        let settings = PipelineSettings {
            timeout: config.request_timeout(),
            max_body_bytes: config.max_form_bytes,
        };
        let options = BuildOptions {
            use_vm: config.use_vm,
            skip_validation: config.skip_validation,
        };
        let state = Self::new(engine, middleware, settings, options);
        if config.live_reload {
            state.with_live_reload()
        } else {
            state
        }
    }

    /// Attach the plugin manager reported by `/ready` and the admin API.
    #[must_use]
    pub fn with_plugins(mut self, plugins: Arc<PluginManager>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Announce every installed table on `/__livereload`.
    #[must_use]
    pub fn with_live_reload(mut self) -> Self {
        self.live = Some(Arc::new(LiveReload::new()));
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn hot_router(&self) -> &Arc<HotRouter> {
        &self.hot
    }

    pub fn middleware(&self) -> &Arc<MiddlewareRegistry> {
        &self.middleware
    }

    pub fn plugins(&self) -> Option<&Arc<PluginManager>> {
        self.plugins.as_ref()
    }

    pub fn live_reload(&self) -> Option<&Arc<LiveReload>> {
        self.live.as_ref()
    }

    pub fn program(&self) -> Option<PathBuf> {
        self.program.read().clone()
    }

    /// Execute `root` in registration mode and install the routes it declares.
    ///
    /// The previous table keeps serving until the new one is installed and
    /// stays in place when anything fails.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` listing preflight problems, the first
    /// registration failure, or a route conflict.
    #[instrument(skip(self, root))]
    pub async fn build_routes(&self, root: &Node) -> Result<usize, RuntimeError> {
        let _rebuild = self.rebuild.lock().await;

        if !self.options.skip_validation {
            let problems = Analyzer::new(&self.engine).run(root);
            if !problems.is_empty() {
                for problem in &problems {
                    warn!(problem = %problem, "preflight analysis");
                }
                let joined: Vec<String> = problems.iter().map(ToString::to_string).collect();
                return Err(RuntimeError::invalid_config(format!(
                    "{} problem(s) found: {}",
                    problems.len(),
                    joined.join("; ")
                )));
            }
        }

        let collector = Arc::new(RouteCollector::new(self.options.use_vm));
        let ctx = Context::new()
            .with_engine(self.engine.clone())
            .with_value(ROUTER, Arc::clone(&collector));
        match self.engine.execute(&ctx, root, &Scope::new()).await {
            Err(e) if !e.is_sentinel() => return Err(e),
            _ => {}
        }

        let table = collector.finish();
        let router = table.into_router(&self.pipeline)?;
        let count = table.len();
        let compiled = table.routes().iter().filter(|r| r.chunk.is_some()).count();
        self.hot.install(table, router);
        info!(routes = count, compiled, "routes built");
        if let Some(live) = &self.live {
            live.announce(count);
        }
        Ok(count)
    }

    /// Load the program at `path`, build its routes and remember the path
    /// for [`reload`](Self::reload).
    ///
    /// # Errors
    ///
    /// Returns the loader error or any [`build_routes`](Self::build_routes)
    /// failure.
    pub async fn load_program(&self, path: &Path) -> Result<usize, RuntimeError> {
        let root = self.engine.loader().load(path)?;
        let count = self.build_routes(&root).await?;
        *self.program.write() = Some(path.to_path_buf());
        Ok(count)
    }

    /// Re-load the current program from disk and hot-swap its routes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when no program was loaded, otherwise as
    /// [`load_program`](Self::load_program).
    pub async fn reload(&self) -> Result<usize, RuntimeError> {
        let path = self
            .program()
            .ok_or_else(|| RuntimeError::invalid_config("no program loaded"))?;
        self.load_program(&path).await
    }

    pub async fn ready(&self) -> ReadyStatus {
        let plugins = match &self.plugins {
            Some(manager) => manager.len().await,
            None => 0,
        };
        ReadyStatus {
            routes: self.hot.table().len(),
            plugins,
            arenas: self.pipeline.arenas().stats(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes", &self.hot.table().len())
            .field("program", &self.program())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(
            Engine::new(),
            Arc::new(MiddlewareRegistry::new()),
            PipelineSettings::default(),
            BuildOptions::default(),
        )
    }

    fn route(method: &str, path: &str) -> Node {
        Node::new(method)
            .with_value(path)
            .with_child(Node::new("do").with_child(Node::new("noop")))
    }

    #[tokio::test]
    async fn test_build_routes_installs_table() {
        let state = state();
        let root = Node::new("root")
            .with_child(route("http.get", "/a"))
            .with_child(route("http.post", "/a"))
            .with_child(route("http.get", "/b/{id}"));

        assert_eq!(state.build_routes(&root).await.unwrap(), 3);
        assert_eq!(state.hot_router().table().len(), 3);
        assert_eq!(state.ready().await.routes, 3);
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_table() {
        let state = state();
        state
            .build_routes(&Node::new("root").with_child(route("http.get", "/a")))
            .await
            .unwrap();

        let conflicting = Node::new("root")
            .with_child(route("http.get", "/x/{id}"))
            .with_child(route("http.get", "/x/{name}"));
        assert!(state.build_routes(&conflicting).await.is_err());
        assert_eq!(state.hot_router().table().routes()[0].pattern, "/a");
    }

    #[tokio::test]
    async fn test_preflight_rejects_unknown_slot() {
        let state = state();
        let root = Node::new("root").with_child(Node::new("no.such.slot"));
        let err = state.build_routes(&root).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }), "{err}");
        assert!(state.hot_router().table().is_empty());
    }

    #[tokio::test]
    async fn test_reload_without_program() {
        let err = state().reload().await.unwrap_err();
        assert!(err.to_string().contains("no program loaded"));
    }

    #[tokio::test]
    async fn test_use_vm_compiles_simple_bodies() {
        let state = AppState::new(
            Engine::new(),
            Arc::new(MiddlewareRegistry::new()),
            PipelineSettings::default(),
            BuildOptions {
                use_vm: true,
                skip_validation: false,
            },
        );
        let root = Node::new("root").with_child(
            Node::new("http.get").with_value("/n").with_child(
                Node::new("do").with_child(Node::new("$x").with_value(1)),
            ),
        );
        state.build_routes(&root).await.unwrap();
        assert!(state.hot_router().table().routes()[0].chunk.is_some());
    }
}
