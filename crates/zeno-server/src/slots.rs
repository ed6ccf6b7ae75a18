//! HTTP slots: route registration, responses, streaming and middleware.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use zeno_common::RuntimeError;
use zeno_core::context::{HTTP_WRITER, ROUTER};
use zeno_core::{Context, Engine, Node, Scope, SlotHandler, SlotMetadata, Value};

use crate::handler::ROUTE_ATTRS;
use crate::middleware::MiddlewareRegistry;
use crate::response::ResponseWriter;
use crate::router::{RouteCollector, RouteDef, RouteDoc, join_path, pattern_params};

/// Context key of the innermost `http.group`.
pub const ROUTE_GROUP: &str = "routeGroup";

/// Default variable bound by `capture`.
pub const CAPTURE_DEFAULT: &str = "output";

/// Prefix and middleware inherited by routes inside a group.
#[derive(Debug, Clone, Default)]
pub struct GroupFrame {
    pub prefix: String,
    pub middleware: Vec<String>,
}

fn writer(ctx: &Context) -> Result<Arc<ResponseWriter>, RuntimeError> {
    ctx.value::<ResponseWriter>(HTTP_WRITER)
        .ok_or_else(|| RuntimeError::failed("no HTTP response in this context"))
}

fn collector(ctx: &Context, slot: &str) -> Result<Arc<RouteCollector>, RuntimeError> {
    ctx.value::<RouteCollector>(ROUTER).ok_or_else(|| {
        RuntimeError::failed(format!("{slot} is only valid while routes are registered"))
    })
}

fn group(ctx: &Context) -> GroupFrame {
    ctx.value::<GroupFrame>(ROUTE_GROUP)
        .map(|frame| (*frame).clone())
        .unwrap_or_default()
}

/// A string attribute or a list of strings.
fn names(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::List(items)) => items.iter().map(Value::to_display_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Nil) | None => Vec::new(),
        Some(other) => vec![other.to_display_string()],
    }
}

/// Body of a route as a standalone block.
fn body_block(node: &Node) -> Node {
    match node.child("do") {
        Some(block) => block.clone(),
        None => Node::new("do").with_children(
            node.children
                .iter()
                .filter(|c| !ROUTE_ATTRS.contains(&c.name.as_str()) && c.name != "as")
                .cloned(),
        ),
    }
}

/// `http.<method>: <path>` with a `do` body.
pub struct Route {
    method: Method,
}

#[async_trait]
impl SlotHandler for Route {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let routes = collector(ctx, &node.name)?;
        let frame = group(ctx);

        let path = engine
            .value_or_attr(node, "path", scope)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::failed(format!("{} requires a path", node.name)))?;
        let pattern = join_path(&frame.prefix, &path);
        let params = pattern_params(&pattern)?;

        let mut middleware = frame.middleware;
        middleware.extend(names(engine.attr(node, "middleware", scope)?));

        let chunk = if routes.compile() {
            match zeno_vm::compile(&body_block(node)) {
                Ok(chunk) => Some(Arc::new(chunk)),
                Err(e) => {
                    tracing::debug!(route = %pattern, reason = %e, "route body stays interpreted");
                    None
                }
            }
        } else {
            None
        };

        let doc = RouteDoc {
            method: self.method.to_string(),
            path: pattern.clone(),
            summary: engine.attr_string(node, "summary", scope)?,
            description: engine.attr_string(node, "description", scope)?,
            tags: names(engine.attr(node, "tags", scope)?),
            path_params: params.clone(),
            query_params: match engine.attr(node, "query", scope)? {
                Some(Value::Map(map)) => map.keys().cloned().collect(),
                other => names(other),
            },
            middleware: middleware.clone(),
        };

        routes.add(RouteDef {
            method: self.method.clone(),
            pattern,
            params,
            middleware,
            node: Arc::new(node.clone()),
            scope: scope.clone(),
            chunk,
            doc,
        });
        Ok(())
    }
}

/// `http.group: <prefix>` with optional `middleware` and a `do` body.
pub struct Group;

#[async_trait]
impl SlotHandler for Group {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let parent = group(ctx);
        let prefix = engine
            .value_or_attr(node, "prefix", scope)?
            .to_display_string();
        let mut middleware = parent.middleware;
        middleware.extend(names(engine.attr(node, "middleware", scope)?));
        let frame = GroupFrame {
            prefix: join_path(&parent.prefix, &prefix),
            middleware,
        };
        let ctx = ctx.with_value(ROUTE_GROUP, Arc::new(frame));
        engine
            .execute_body(&ctx, node, scope, &["prefix", "middleware"])
            .await
    }
}

/// `middleware.define: <name>` with a `do` body.
pub struct DefineMiddleware {
    registry: Arc<MiddlewareRegistry>,
}

#[async_trait]
impl SlotHandler for DefineMiddleware {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let name = engine
            .value_or_attr(node, "name", scope)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::failed("middleware.define requires a name"))?;
        let body = node
            .child("do")
            .cloned()
            .ok_or_else(|| RuntimeError::failed(format!("middleware '{name}' has no do block")))?;
        self.registry.define(name, body);
        Ok(())
    }
}

/// `http.response` with `status`, `body`, `headers`; ends the request.
pub struct Respond;

#[async_trait]
impl SlotHandler for Respond {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let out = writer(ctx)?;
        if let Some(Value::Map(headers)) = engine.attr(node, "headers", scope)? {
            for (name, value) in &headers {
                out.set_header(name, &value.to_display_string())?;
            }
        }
        let status = status_of(engine.attr(node, "status", scope)?, 200)?;
        let body = match engine.attr(node, "body", scope)? {
            Some(body) => body,
            None => engine.resolve(&node.value, scope)?,
        };
        out.respond(status, &body)?;
        Err(RuntimeError::Return)
    }
}

/// `http.redirect: <url>` with an optional `status` (302).
pub struct Redirect;

#[async_trait]
impl SlotHandler for Redirect {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let url = engine.value_or_attr(node, "url", scope)?.to_display_string();
        if url.is_empty() {
            return Err(RuntimeError::failed("http.redirect requires a url"));
        }
        let status = status_of(engine.attr(node, "status", scope)?, 302)?;
        writer(ctx)?.redirect(&url, status)?;
        Err(RuntimeError::Return)
    }
}

/// `http.write: <text>` appends to the body.
pub struct Write;

#[async_trait]
impl SlotHandler for Write {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let value = engine.value_or_attr(node, "body", scope)?;
        writer(ctx)?.write(text_of(&value).as_bytes())
    }
}

/// `http.header` with `name` and `value`.
pub struct Header;

#[async_trait]
impl SlotHandler for Header {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let name = engine
            .value_or_attr(node, "name", scope)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::failed("http.header requires a name"))?;
        let value = engine.attr(node, "value", scope)?.unwrap_or_default();
        writer(ctx)?.set_header(&name, &value.to_display_string())
    }
}

/// `sse.send` with `data` and optional `event` and `id`.
pub struct SendEvent;

#[async_trait]
impl SlotHandler for SendEvent {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let data = text_of(&engine.value_or_attr(node, "data", scope)?);
        let event = engine.attr_string(node, "event", scope)?;
        let id = engine.attr_string(node, "id", scope)?;
        writer(ctx)?.send_event(event.as_deref(), &data, id.as_deref())
    }
}

/// `capture` runs its `do` block into a buffer bound under `as`.
pub struct Capture;

#[async_trait]
impl SlotHandler for Capture {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let buffer = Arc::new(ResponseWriter::capture());
        let inner = ctx.with_value(HTTP_WRITER, Arc::clone(&buffer));
        let result = engine.execute_body(&inner, node, scope, &["as"]).await;
        let target = node.as_name().unwrap_or_else(|| CAPTURE_DEFAULT.to_string());
        scope.set(target, Value::String(buffer.take_text()));
        result
    }
}

/// `http.block_ip: <address>`.
pub struct BlockIp {
    registry: Arc<MiddlewareRegistry>,
}

#[async_trait]
impl SlotHandler for BlockIp {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let raw = engine.value_or_attr(node, "ip", scope)?.to_display_string();
        let ip: IpAddr = raw
            .trim()
            .parse()
            .map_err(|_| RuntimeError::failed(format!("'{raw}' is not an IP address")))?;
        self.registry.block_ip(ip);
        Ok(())
    }
}

fn status_of(value: Option<Value>, default: u16) -> Result<u16, RuntimeError> {
    let Some(value) = value.filter(|v| !v.is_nil()) else {
        return Ok(default);
    };
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| RuntimeError::failed(format!("invalid status {}", value.to_display_string())))
}

/// Maps and lists as JSON, everything else as text.
fn text_of(value: &Value) -> String {
    match value {
        Value::Map(_) | Value::List(_) => value.to_json().to_string(),
        other => other.to_display_string(),
    }
}

/// Register the HTTP slots on `engine`.
pub fn register(engine: &Engine, middleware: &Arc<MiddlewareRegistry>) {
    let routes = [
        ("http.get", Method::GET),
        ("http.post", Method::POST),
        ("http.put", Method::PUT),
        ("http.patch", Method::PATCH),
        ("http.delete", Method::DELETE),
    ];
    for (name, method) in routes {
        engine.register(
            name,
            Arc::new(Route {
                method: method.clone(),
            }),
            SlotMetadata::new(format!("Register a {method} route"))
                .example(format!("{name}: \"/users/{{id}}\"\n  do: ..."))
                .required("path", "string", "Path pattern with {name} holes")
                .input("middleware", "any", "Middleware name or list of names")
                .input("summary", "string", "One-line summary for the route docs")
                .input("description", "string", "Longer description for the route docs")
                .input("tags", "any", "Documentation tags")
                .input("query", "any", "Documented query parameters")
                .value_type("string"),
        );
    }
    engine.register(
        "http.group",
        Arc::new(Group),
        SlotMetadata::new("Prefix a set of routes and attach middleware to them")
            .required("prefix", "string", "Path prefix")
            .input("middleware", "any", "Middleware applied to every route inside")
            .block("do"),
    );
    engine.register(
        "middleware.define",
        Arc::new(DefineMiddleware {
            registry: Arc::clone(middleware),
        }),
        SlotMetadata::new("Define a reusable middleware body")
            .required("name", "string", "Middleware name")
            .block("do"),
    );
    engine.register(
        "http.response",
        Arc::new(Respond),
        SlotMetadata::new("Send the response and end the request")
            .example("http.response:\n  status: 200\n  body: $user")
            .input("status", "int", "Status code (200)")
            .input("body", "any", "Maps and lists are sent as JSON")
            .input("headers", "map", "Extra response headers"),
    );
    engine.register(
        "http.redirect",
        Arc::new(Redirect),
        SlotMetadata::new("Redirect and end the request")
            .required("url", "string", "Target location")
            .input("status", "int", "Status code (302)"),
    );
    engine.register(
        "http.write",
        Arc::new(Write),
        SlotMetadata::new("Append to the response body").required("body", "any", "Content"),
    );
    engine.register(
        "http.header",
        Arc::new(Header),
        SlotMetadata::new("Set a response header")
            .required("name", "string", "Header name")
            .input("value", "string", "Header value"),
    );
    engine.register(
        "sse.send",
        Arc::new(SendEvent),
        SlotMetadata::new("Stream one server-sent event")
            .required("data", "any", "Event payload")
            .input("event", "string", "Event name")
            .input("id", "string", "Event id"),
    );
    engine.register(
        "capture",
        Arc::new(Capture),
        SlotMetadata::new("Collect the output of a block into a variable")
            .input("as", "string", "Variable name (default `output`)")
            .block("do"),
    );
    engine.register(
        "http.block_ip",
        Arc::new(BlockIp {
            registry: Arc::clone(middleware),
        }),
        SlotMetadata::new("Reject further requests from an address")
            .required("ip", "string", "IPv4 or IPv6 address"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Engine, Arc<MiddlewareRegistry>) {
        let engine = Engine::new();
        let middleware = Arc::new(MiddlewareRegistry::new());
        register(&engine, &middleware);
        (engine, middleware)
    }

    async fn collect(engine: &Engine, program: &Node) -> crate::router::RouteTable {
        let routes = Arc::new(RouteCollector::new(false));
        let ctx = Context::new().with_value(ROUTER, Arc::clone(&routes));
        engine.execute(&ctx, program, &Scope::new()).await.unwrap();
        routes.finish()
    }

    #[tokio::test]
    async fn test_groups_prefix_routes() {
        let (engine, _) = engine();
        let program = Node::new("root").with_child(
            Node::new("http.group")
                .with_value("/api")
                .with_attr("middleware", "audit")
                .with_child(
                    Node::new("do").with_child(
                        Node::new("http.get")
                            .with_value("/users/{id}")
                            .with_attr("middleware", "auth")
                            .with_attr("summary", "Fetch a user")
                            .with_child(Node::new("do")),
                    ),
                ),
        );
        let table = collect(&engine, &program).await;
        let route = &table.routes()[0];
        assert_eq!(route.pattern, "/api/users/{id}");
        assert_eq!(route.params, ["id"]);
        assert_eq!(route.middleware, ["audit", "auth"]);
        assert_eq!(route.doc.summary.as_deref(), Some("Fetch a user"));
    }

    #[tokio::test]
    async fn test_route_outside_registration_fails() {
        let (engine, _) = engine();
        let node = Node::new("http.get").with_value("/x");
        let err = engine
            .execute(&Context::new(), &node, &Scope::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only valid while routes are registered"), "{err}");
    }

    #[tokio::test]
    async fn test_respond_writes_and_returns() {
        let (engine, _) = engine();
        let out = Arc::new(ResponseWriter::capture());
        let ctx = Context::new().with_value(HTTP_WRITER, Arc::clone(&out));
        let scope = Scope::new();
        scope.set("u", Value::Int(42));
        let node = Node::new("http.response")
            .with_attr("status", 201)
            .with_attr("body", "$u");

        let err = engine.execute(&ctx, &node, &scope).await.unwrap_err();
        assert_eq!(err, RuntimeError::Return);
        assert_eq!(out.status().as_u16(), 201);
        assert_eq!(out.take_text(), "42");
    }

    #[tokio::test]
    async fn test_capture_binds_output() {
        let (engine, _) = engine();
        let out = Arc::new(ResponseWriter::capture());
        let ctx = Context::new().with_value(HTTP_WRITER, Arc::clone(&out));
        let scope = Scope::new();
        let node = Node::new("capture").with_attr("as", "html").with_child(
            Node::new("do")
                .with_child(Node::new("http.write").with_value("<b>"))
                .with_child(Node::new("http.write").with_value("hi</b>")),
        );

        engine.execute(&ctx, &node, &scope).await.unwrap();
        assert_eq!(scope.get("html"), Some(Value::from("<b>hi</b>")));
        assert!(out.take_text().is_empty());
    }

    #[tokio::test]
    async fn test_middleware_define_and_block_ip() {
        let (engine, middleware) = engine();
        let program = Node::new("root")
            .with_child(
                Node::new("middleware.define")
                    .with_value("audit")
                    .with_child(Node::new("do").with_child(Node::new("noop"))),
            )
            .with_child(Node::new("http.block_ip").with_value("192.0.2.1"));
        engine
            .execute(&Context::new(), &program, &Scope::new())
            .await
            .unwrap();

        assert!(middleware.resolve("audit").is_some());
        assert!(middleware.is_blocked("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(None, 302).unwrap(), 302);
        assert_eq!(status_of(Some(Value::from("404")), 200).unwrap(), 404);
        assert!(status_of(Some(Value::from("teapot")), 200).is_err());
    }
}
