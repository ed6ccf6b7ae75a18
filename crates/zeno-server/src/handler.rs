//! The per-request pipeline.
//!
//! Each matched request runs in its own task:
//!
//! 1. ingest the request and reject blocked addresses
//! 2. acquire an arena and a request scope under the route's scope
//! 3. bind path parameters, `params`, `form`, `request`, `path`, `method`
//! 4. run the route's middleware, then its body, under the request deadline
//! 5. turn the outcome into a response and release the arena
//!
//! A handler that starts an event stream gets its response as soon as the
//! head is committed; the body keeps running and closes the stream when it
//! finishes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};
use zeno_common::RuntimeError;
use zeno_core::context::{HTTP_REQUEST, HTTP_WRITER};
use zeno_core::{ArenaPool, Context, Engine, Scope, Value};
use zeno_vm::{EngineHost, Vm};

use crate::middleware::{Middleware, MiddlewareRegistry, PRINCIPAL_KEY};
use crate::request::{IngestError, RequestData};
use crate::response::ResponseWriter;
use crate::router::RouteDef;

/// Attribute children of a route node that are not part of its body.
pub const ROUTE_ATTRS: &[&str] = &["middleware", "summary", "description", "tags", "query"];

/// Limits applied to every request.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Shared state behind every route handler.
#[derive(Debug)]
pub struct Pipeline {
    engine: Engine,
    arenas: ArenaPool,
    middleware: Arc<MiddlewareRegistry>,
    settings: PipelineSettings,
}

enum Finished {
    Done(Result<(), RuntimeError>),
    Panicked,
    TimedOut,
}

impl Pipeline {
    pub fn new(
        engine: Engine,
        arenas: ArenaPool,
        middleware: Arc<MiddlewareRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            engine,
            arenas,
            middleware,
            settings,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn arenas(&self) -> &ArenaPool {
        &self.arenas
    }

    pub fn middleware(&self) -> &Arc<MiddlewareRegistry> {
        &self.middleware
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Serve one request matched to `route`.
    pub async fn handle(
        self: Arc<Self>,
        route: Arc<RouteDef>,
        raw_params: HashMap<String, String>,
        request: Request,
    ) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %route.method,
            route = %route.pattern
        );
        self.serve(route, raw_params, request).instrument(span).await
    }

    async fn serve(
        self: Arc<Self>,
        route: Arc<RouteDef>,
        raw_params: HashMap<String, String>,
        request: Request,
    ) -> Response {
        let started = Instant::now();
        let data = match RequestData::ingest(request, self.settings.max_body_bytes).await {
            Ok(data) => data,
            Err(e @ IngestError::TooLarge { .. }) => {
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string());
            }
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if let Some(ip) = data.client_ip {
            if self.middleware.is_blocked(ip) {
                warn!(%ip, "blocked address rejected");
                return error_response(StatusCode::FORBIDDEN, "Forbidden");
            }
        }

        let (writer, head) = ResponseWriter::for_request();
        let writer = Arc::new(writer);
        let data = Arc::new(data);
        let ctx = Context::new()
            .with_engine(self.engine.clone())
            .with_timeout(self.settings.timeout)
            .with_value(HTTP_REQUEST, Arc::clone(&data))
            .with_value(HTTP_WRITER, Arc::clone(&writer));
        let deadline = ctx.deadline();

        let pipeline = Arc::clone(&self);
        let body_route = Arc::clone(&route);
        let mut task = tokio::spawn(
            async move {
                let params = body_route.bind_params(&raw_params);
                pipeline.run(&ctx, &body_route, &data, params).await
            }
            .in_current_span(),
        );

        let backstop = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        // A committed stream head wins over the task finishing.
        let finished = tokio::select! {
            biased;
            Ok(streaming) = head => {
                let writer = Arc::clone(&writer);
                tokio::spawn(
                    async move {
                        match task.await {
                            Ok(Err(e)) if !e.is_sentinel() => warn!(error = %e, "stream handler failed"),
                            Err(e) if e.is_panic() => error!("stream handler panicked"),
                            _ => {}
                        }
                        writer.finish();
                    }
                    .in_current_span(),
                );
                info!(status = streaming.status().as_u16(), "event stream opened");
                return streaming;
            }
            joined = &mut task => match joined {
                Ok(result) => Finished::Done(result),
                Err(e) if e.is_panic() => Finished::Panicked,
                Err(_) => Finished::TimedOut,
            },
            () = backstop => {
                task.abort();
                // Wait for the task to drop, releasing its arena.
                let _ = task.await;
                Finished::TimedOut
            }
        };
        writer.finish();

        let response = match finished {
            Finished::Done(Ok(())) => writer.to_response(),
            Finished::Done(Err(e)) if e.is_sentinel() => writer.to_response(),
            Finished::Done(Err(e)) if e.is_timeout() => {
                warn!(error = %e, "request timed out");
                error_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout")
            }
            Finished::TimedOut => {
                warn!(timeout_ms = self.timeout_ms(), "request timed out");
                error_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout")
            }
            Finished::Done(Err(e)) if e.is_security() => {
                warn!(error = %e, "security violation");
                error_response(StatusCode::FORBIDDEN, "Forbidden")
            }
            Finished::Done(Err(e)) => {
                error!(error = %e, "request failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
            Finished::Panicked => {
                error!("request handler panicked");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        info!(
            status = response.status().as_u16(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "request completed"
        );
        response
    }

    /// Run middleware and the route body in a fresh request scope.
    async fn run(
        &self,
        ctx: &Context,
        route: &RouteDef,
        data: &RequestData,
        params: zeno_core::ValueMap,
    ) -> Result<(), RuntimeError> {
        let arena = self.arenas.acquire();
        let scope = route.scope.frame_child_in(arena.arena());
        bind_request(&scope, data, &params);

        let result = AssertUnwindSafe(async {
            self.apply_middleware(ctx, route, data, &scope).await?;
            match &route.chunk {
                Some(chunk) => {
                    let host = EngineHost::new(self.engine.clone(), ctx.clone(), scope.clone());
                    Vm::new(host).run(Arc::clone(chunk)).await
                }
                None => {
                    self.engine
                        .execute_body(ctx, &route.node, &scope, ROUTE_ATTRS)
                        .await
                }
            }
        })
        .catch_unwind()
        .await;
        drop(scope);
        drop(arena);

        match result {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::failed("route handler panicked")),
        }
    }

    async fn apply_middleware(
        &self,
        ctx: &Context,
        route: &RouteDef,
        data: &RequestData,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        for name in &route.middleware {
            match self.middleware.resolve(name) {
                Some(Middleware::Native(native)) => match native.check(data).await {
                    Ok(Some(principal)) => scope.set(PRINCIPAL_KEY, principal),
                    Ok(None) => {}
                    Err(rejection) => {
                        debug!(middleware = %name, status = rejection.status.as_u16(), "request rejected");
                        let writer = ctx
                            .value::<ResponseWriter>(HTTP_WRITER)
                            .ok_or_else(|| RuntimeError::failed("no response writer"))?;
                        let mut body = zeno_core::ValueMap::new();
                        body.insert("error".into(), Value::from(rejection.message));
                        writer.respond(rejection.status.as_u16(), &Value::Map(body))?;
                        return Err(RuntimeError::Return);
                    }
                },
                Some(Middleware::Logic(body)) => {
                    self.engine.execute_body(ctx, &body, scope, &[]).await?;
                }
                None => {
                    return Err(RuntimeError::failed(format!(
                        "middleware '{name}' is not defined"
                    )));
                }
            }
        }
        Ok(())
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

fn bind_request(scope: &Scope, data: &RequestData, params: &zeno_core::ValueMap) {
    for (name, value) in params {
        scope.set(name.clone(), value.clone());
    }
    scope.set("params", Value::Map(params.clone()));
    scope.set("form", Value::Map(data.form.clone()));
    scope.set("request", data.to_value(params));
    scope.set("path", Value::from(data.path.as_str()));
    scope.set("method", Value::from(data.method.as_str()));
}

/// JSON error body with a message safe to show clients.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout");
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
    }

    #[test]
    fn test_bind_request() {
        let data = RequestData {
            method: axum::http::Method::GET,
            url: "/users/7?x=1".into(),
            path: "/users/7".into(),
            headers: axum::http::HeaderMap::new(),
            query: zeno_core::ValueMap::new(),
            form: zeno_core::ValueMap::new(),
            body: Value::Map(zeno_core::ValueMap::new()),
            client_ip: None,
        };
        let mut params = zeno_core::ValueMap::new();
        params.insert("id".into(), Value::from("7"));
        let scope = Scope::new();
        bind_request(&scope, &data, &params);

        assert_eq!(scope.get("id"), Some(Value::from("7")));
        assert_eq!(scope.resolve_path("params.id"), Value::from("7"));
        assert_eq!(scope.resolve_path("request.path"), Value::from("/users/7"));
        assert_eq!(scope.get("method"), Some(Value::from("GET")));
    }

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.max_body_bytes, 10 * 1024 * 1024);
    }
}
