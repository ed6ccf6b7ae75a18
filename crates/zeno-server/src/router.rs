//! Route tables and the hot-swappable router.
//!
//! Executing a program with a [`RouteCollector`] in the context makes
//! `http.*` slots record [`RouteDef`]s. [`RouteTable::into_router`] turns
//! them into an axum router, and [`HotRouter`] holds the live one behind an
//! atomic pointer so a rebuilt table can replace it while in-flight
//! requests finish on the table they started with.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::extract::{Path, Request};
use axum::http::Method;
use axum::response::Response;
use axum::routing::{MethodFilter, MethodRouter, on};
use parking_lot::Mutex;
use serde::Serialize;
use tower::ServiceExt;
use zeno_common::RuntimeError;
use zeno_core::{Node, Scope, Value, ValueMap};
use zeno_vm::Chunk;

use crate::handler::Pipeline;

/// Documentation attached to a route.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteDoc {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub path_params: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middleware: Vec<String>,
}

/// One registered route.
pub struct RouteDef {
    pub method: Method,
    /// Pattern with `{name}` holes, group prefix applied.
    pub pattern: String,
    pub params: Vec<String>,
    pub middleware: Vec<String>,
    /// The `http.<method>` node; its body runs per request.
    pub node: Arc<Node>,
    /// Scope the route was registered in, parent of every request scope.
    pub scope: Scope,
    /// Compiled body when the VM path is enabled and the body compiles.
    pub chunk: Option<Arc<Chunk>>,
    pub doc: RouteDoc,
}

impl RouteDef {
    /// Name the positional captures of the matched path.
    pub fn bind_params(&self, raw: &HashMap<String, String>) -> ValueMap {
        self.params
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                raw.get(&capture_name(i))
                    .map(|value| (name.clone(), Value::from(value.as_str())))
            })
            .collect()
    }
}

impl std::fmt::Debug for RouteDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDef")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("compiled", &self.chunk.is_some())
            .finish_non_exhaustive()
    }
}

/// Receives routes while a program registers them.
#[derive(Debug, Default)]
pub struct RouteCollector {
    routes: Mutex<Vec<RouteDef>>,
    compile: bool,
}

impl RouteCollector {
    /// `compile` asks for route bodies to be compiled to bytecode.
    pub fn new(compile: bool) -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            compile,
        }
    }

    pub fn compile(&self) -> bool {
        self.compile
    }

    pub fn add(&self, route: RouteDef) {
        tracing::debug!(method = %route.method, route = %route.pattern, "route registered");
        self.routes.lock().push(route);
    }

    pub fn finish(&self) -> RouteTable {
        RouteTable {
            routes: std::mem::take(&mut *self.routes.lock())
                .into_iter()
                .map(Arc::new)
                .collect(),
        }
    }
}

/// An immutable set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<RouteDef>>,
}

impl RouteTable {
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Arc<RouteDef>] {
        &self.routes
    }

    pub fn docs(&self) -> Vec<RouteDoc> {
        self.routes.iter().map(|r| r.doc.clone()).collect()
    }

    /// Build the axum router dispatching into `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed patterns and for two routes
    /// with the same method and shape.
    pub fn into_router(&self, pipeline: &Arc<Pipeline>) -> Result<Router, RuntimeError> {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
        let mut seen: HashMap<(Method, String), &str> = HashMap::new();

        for route in &self.routes {
            let path = matcher_path(&route.pattern)?;
            if let Some(previous) = seen.insert((route.method.clone(), path.clone()), &route.pattern) {
                return Err(RuntimeError::invalid_config(format!(
                    "route {} {} conflicts with {previous}",
                    route.method, route.pattern
                )));
            }
            let filter = method_filter(&route.method)?;
            let handler = {
                let route = Arc::clone(route);
                let pipeline = Arc::clone(pipeline);
                move |params: Option<Path<HashMap<String, String>>>, request: Request| async move {
                    let raw = params.map(|Path(p)| p).unwrap_or_default();
                    pipeline.handle(route, raw, request).await
                }
            };
            let entry = by_path.remove(&path);
            let method_router = match entry {
                Some(existing) => existing.on(filter, handler),
                None => on(filter, handler),
            };
            by_path.insert(path, method_router);
        }

        Ok(by_path
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| router.route(&path, methods)))
    }
}

/// The currently installed route table.
struct Installed {
    router: Router,
    table: Arc<RouteTable>,
}

/// Entry point that always serves the most recently installed table.
pub struct HotRouter {
    current: ArcSwap<Installed>,
}

impl Default for HotRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl HotRouter {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Installed {
                router: Router::new(),
                table: Arc::new(RouteTable::default()),
            }),
        }
    }

    /// Replace the live table.
    pub fn install(&self, table: RouteTable, router: Router) {
        let routes = table.len();
        self.current.store(Arc::new(Installed {
            router,
            table: Arc::new(table),
        }));
        tracing::info!(routes, "route table installed");
    }

    pub fn table(&self) -> Arc<RouteTable> {
        Arc::clone(&self.current.load().table)
    }

    /// Route `request` through the table current at arrival.
    pub async fn dispatch(&self, request: Request) -> Response {
        let installed = self.current.load_full();
        match installed.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

impl std::fmt::Debug for HotRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotRouter")
            .field("routes", &self.current.load().table.len())
            .finish_non_exhaustive()
    }
}

fn capture_name(index: usize) -> String {
    format!("p{index}")
}

/// Parameter names of a `{name}` pattern, in order.
///
/// # Errors
///
/// Returns `InvalidConfig` for unbalanced braces, empty or duplicate names.
pub fn pattern_params(pattern: &str) -> Result<Vec<String>, RuntimeError> {
    let mut names = Vec::new();
    for segment in pattern.split('/') {
        if let Some(inner) = segment.strip_prefix('{') {
            let name = inner
                .strip_suffix('}')
                .map(|n| n.trim_start_matches('*'))
                .filter(|n| !n.is_empty() && !n.contains(['{', '}']))
                .ok_or_else(|| bad_pattern(pattern))?;
            if names.iter().any(|n| n == name) {
                return Err(RuntimeError::invalid_config(format!(
                    "route {pattern} repeats parameter '{name}'"
                )));
            }
            names.push(name.to_string());
        } else if segment.contains(['{', '}']) {
            return Err(bad_pattern(pattern));
        }
    }
    Ok(names)
}

/// Matcher syntax with positional capture names, so differently named
/// holes at the same position never collide.
fn matcher_path(pattern: &str) -> Result<String, RuntimeError> {
    if !pattern.starts_with('/') {
        return Err(bad_pattern(pattern));
    }
    pattern_params(pattern)?;
    let catch_all = pattern.find("{*");
    if catch_all.is_some_and(|at| pattern[at..].contains('/')) {
        return Err(bad_pattern(pattern));
    }
    let mut index = 0;
    let segments: Vec<String> = pattern
        .split('/')
        .map(|segment| match segment.strip_prefix('{') {
            Some(inner) => {
                let sigil = if inner.starts_with('*') { '*' } else { ':' };
                let name = format!("{sigil}{}", capture_name(index));
                index += 1;
                name
            }
            None => segment.to_string(),
        })
        .collect();
    Ok(segments.join("/"))
}

fn bad_pattern(pattern: &str) -> RuntimeError {
    RuntimeError::invalid_config(format!("malformed route pattern '{pattern}'"))
}

fn method_filter(method: &Method) -> Result<MethodFilter, RuntimeError> {
    Ok(match *method {
        Method::GET => MethodFilter::GET,
        Method::POST => MethodFilter::POST,
        Method::PUT => MethodFilter::PUT,
        Method::PATCH => MethodFilter::PATCH,
        Method::DELETE => MethodFilter::DELETE,
        Method::HEAD => MethodFilter::HEAD,
        Method::OPTIONS => MethodFilter::OPTIONS,
        _ => {
            return Err(RuntimeError::invalid_config(format!(
                "unsupported method {method}"
            )));
        }
    })
}

/// Join a group prefix and a route path.
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{path}"),
        (false, true) => format!("/{}", prefix.trim_start_matches('/')),
        (false, false) => format!("/{}/{path}", prefix.trim_start_matches('/')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_path_is_positional() {
        assert_eq!(matcher_path("/users/{id}").unwrap(), "/users/:p0");
        assert_eq!(
            matcher_path("/users/{uid}/posts/{post}").unwrap(),
            "/users/:p0/posts/:p1"
        );
        assert_eq!(matcher_path("/files/{*rest}").unwrap(), "/files/*p0");
        assert_eq!(matcher_path("/health").unwrap(), "/health");
    }

    #[test]
    fn test_malformed_patterns() {
        assert!(matcher_path("users").is_err());
        assert!(matcher_path("/users/{id").is_err());
        assert!(matcher_path("/users/x{id}").is_err());
        assert!(matcher_path("/a/{id}/b/{id}").is_err());
        assert!(matcher_path("/a/{}").is_err());
        assert!(matcher_path("/a/{*rest}/b").is_err());
    }

    #[test]
    fn test_pattern_params() {
        assert_eq!(pattern_params("/a/{x}/b/{*y}").unwrap(), ["x", "y"]);
        assert!(pattern_params("/plain").unwrap().is_empty());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "/users"), "/users");
        assert_eq!(join_path("/api/", "/users"), "/api/users");
        assert_eq!(join_path("api", "users/{id}"), "/api/users/{id}");
        assert_eq!(join_path("/api", "/"), "/api");
        assert_eq!(join_path("", ""), "/");
    }

    #[test]
    fn test_method_filter() {
        assert!(method_filter(&Method::PATCH).is_ok());
        assert!(method_filter(&Method::CONNECT).is_err());
    }

    #[test]
    fn test_bind_params() {
        let route = RouteDef {
            method: Method::GET,
            pattern: "/users/{id}".into(),
            params: vec!["id".into()],
            middleware: Vec::new(),
            node: Arc::new(Node::new("http.get")),
            scope: Scope::new(),
            chunk: None,
            doc: RouteDoc::default(),
        };
        let raw = HashMap::from([("p0".to_string(), "7".to_string())]);
        assert_eq!(route.bind_params(&raw)["id"], Value::from("7"));
    }
}
