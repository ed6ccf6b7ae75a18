//! End-to-end tests for the HTTP surface.
//!
//! These tests register programs through the `http.*` slots and drive the
//! resulting router with `tower::ServiceExt::oneshot`:
//! - route registration and parameter binding
//! - deadlines and arena release
//! - native and logic middleware
//! - groups, streaming, forms and the admin API

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header};
use tower::ServiceExt;
use zeno_common::{AdminConfig, RuntimeConfig};
use zeno_core::{Engine, Node, Value};
use zeno_server::{AppState, BuildOptions, MiddlewareRegistry, PipelineSettings, build_router};

const SECRET: &str = "integration-secret";

fn state_with(settings: PipelineSettings) -> AppState {
    AppState::new(
        Engine::new(),
        Arc::new(MiddlewareRegistry::with_jwt_secret(Some(SECRET))),
        settings,
        BuildOptions::default(),
    )
}

fn state() -> AppState {
    state_with(PipelineSettings::default())
}

fn app(state: &AppState) -> Router {
    build_router(state.clone(), &AdminConfig::default())
}

fn set(name: &str, value: impl Into<Value>) -> Node {
    Node::new(format!("${name}")).with_value(value)
}

fn respond(status: i64, body: &str) -> Node {
    Node::new("http.response")
        .with_attr("status", status)
        .with_attr("body", body)
}

fn get(path: &str, body: Node) -> Node {
    Node::new("http.get")
        .with_value(path)
        .with_child(Node::new("do").with_children(body.children))
}

fn block(children: impl IntoIterator<Item = Node>) -> Node {
    Node::new("do").with_children(children)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn get_request(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

// ============================================================================
// Test: Register + Route
// ============================================================================

#[tokio::test]
async fn test_register_and_route() {
    let state = state();
    let root = Node::new("root").with_child(get(
        "/users/{id}",
        block([set("u", 42), respond(200, "$u")]),
    ));
    state.build_routes(&root).await.unwrap();

    let (status, body) = send(&app(&state), get_request("/users/7")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "42");
}

#[tokio::test]
async fn test_path_params_are_bound() {
    let state = state();
    let root = Node::new("root").with_child(get(
        "/orgs/{org}/users/{id}",
        block([respond(200, "$org + \"/\" + $params.id")]),
    ));
    state.build_routes(&root).await.unwrap();

    let (status, body) = send(&app(&state), get_request("/orgs/acme/users/9")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "acme/9");
}

#[tokio::test]
async fn test_unmatched_and_wrong_method() {
    let state = state();
    let root = Node::new("root").with_child(get("/only-get", block([respond(200, "ok")])));
    state.build_routes(&root).await.unwrap();
    let app = app(&state);

    let (status, _) = send(&app, get_request("/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let post = Request::post("/only-get").body(Body::empty()).unwrap();
    let (status, _) = send(&app, post).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

// ============================================================================
// Test: Timeout
// ============================================================================

#[tokio::test]
async fn test_unbounded_loop_times_out() {
    let mut config = RuntimeConfig::default();
    config
        .apply_env([("ZENO_REQUEST_TIMEOUT".to_string(), "100ms".to_string())])
        .unwrap();
    let state = AppState::from_config(Engine::new(), &config.server);
    let root = Node::new("root").with_child(get(
        "/spin",
        block([Node::new("for")
            .with_value("1..")
            .with_child(block([Node::new("noop")]))]),
    ));
    state.build_routes(&root).await.unwrap();

    let started = Instant::now();
    let (status, _) = send(&app(&state), get_request("/spin")).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() <= Duration::from_millis(300), "{:?}", started.elapsed());

    let stats = state.pipeline().arenas().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, stats.created);
}

#[tokio::test]
async fn test_handler_error_is_internal() {
    let root = Node::new("root").with_child(get(
        "/boom",
        block([Node::new("call").with_value("undefined_function")]),
    ));
    let state = AppState::new(
        Engine::new(),
        Arc::new(MiddlewareRegistry::new()),
        PipelineSettings::default(),
        BuildOptions {
            use_vm: false,
            skip_validation: true,
        },
    );
    state.build_routes(&root).await.unwrap();

    let (status, body) = send(&app(&state), get_request("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Internal Server Error"));
    assert!(!body.contains("undefined_function"));
}

// ============================================================================
// Test: Middleware
// ============================================================================

fn token(sub: &str) -> String {
    let claims = serde_json::json!({"sub": sub, "exp": 4_102_444_800_u64});
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_bearer_auth_middleware() {
    let state = state();
    let root = Node::new("root").with_child(
        Node::new("http.get")
            .with_value("/me")
            .with_attr("middleware", "auth")
            .with_child(block([respond(200, "$auth.sub")])),
    );
    state.build_routes(&root).await.unwrap();
    let app = app(&state);

    let (status, body) = send(&app, get_request("/me")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("missing bearer token"));

    let request = Request::get("/me")
        .header(header::AUTHORIZATION, format!("Bearer {}", token("ada")))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ada");
}

#[tokio::test]
async fn test_logic_middleware_in_group() {
    let state = state();
    let root = Node::new("root")
        .with_child(
            Node::new("middleware.define")
                .with_value("stamp")
                .with_child(block([set("stamp", "stamped")])),
        )
        .with_child(
            Node::new("middleware.define").with_value("deny").with_child(block([
                Node::new("if")
                    .with_value("$request.query.key != \"open\"")
                    .with_child(Node::new("then").with_child(respond(403, "denied"))),
            ])),
        )
        .with_child(
            Node::new("http.group")
                .with_value("/api")
                .with_attr("middleware", "stamp")
                .with_child(block([
                    get("/plain", block([respond(200, "$stamp")])),
                    Node::new("http.get")
                        .with_value("/guarded")
                        .with_attr("middleware", "deny")
                        .with_child(block([respond(200, "inside")])),
                ])),
        );
    state.build_routes(&root).await.unwrap();
    let app = app(&state);

    assert_eq!(
        send(&app, get_request("/api/plain")).await,
        (StatusCode::OK, "stamped".to_string())
    );
    assert_eq!(
        send(&app, get_request("/api/guarded")).await,
        (StatusCode::FORBIDDEN, "denied".to_string())
    );
    assert_eq!(
        send(&app, get_request("/api/guarded?key=open")).await,
        (StatusCode::OK, "inside".to_string())
    );
}

#[tokio::test]
async fn test_blocked_address_rejected() {
    let state = state();
    let root = Node::new("root")
        .with_child(Node::new("http.block_ip").with_value("203.0.113.9"))
        .with_child(get("/", block([respond(200, "welcome")])));
    state.build_routes(&root).await.unwrap();
    let app = app(&state);

    let blocked = Request::get("/")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, blocked).await.0, StatusCode::FORBIDDEN);

    let allowed = Request::get("/")
        .header("x-forwarded-for", "198.51.100.1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, allowed).await.0, StatusCode::OK);
}

// ============================================================================
// Test: Bodies and streaming
// ============================================================================

#[tokio::test]
async fn test_json_and_form_bodies() {
    let state = state();
    let root = Node::new("root")
        .with_child(
            Node::new("http.post")
                .with_value("/json")
                .with_child(block([respond(201, "$request.body.name")])),
        )
        .with_child(
            Node::new("http.post")
                .with_value("/form")
                .with_child(block([respond(200, "$form.city")])),
        );
    state.build_routes(&root).await.unwrap();
    let app = app(&state);

    let json = Request::post("/json")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"ada"}"#))
        .unwrap();
    assert_eq!(send(&app, json).await, (StatusCode::CREATED, "ada".to_string()));

    let form = Request::post("/form")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("city=Lisbon&zip=1000"))
        .unwrap();
    assert_eq!(send(&app, form).await, (StatusCode::OK, "Lisbon".to_string()));
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let state = state_with(PipelineSettings {
        max_body_bytes: 16,
        ..PipelineSettings::default()
    });
    let root = Node::new("root").with_child(
        Node::new("http.post")
            .with_value("/upload")
            .with_child(block([respond(200, "ok")])),
    );
    state.build_routes(&root).await.unwrap();

    let request = Request::post("/upload")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    assert_eq!(send(&app(&state), request).await.0, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_server_sent_events() {
    let state = state();
    let root = Node::new("root").with_child(get(
        "/events",
        block([
            Node::new("sse.send")
                .with_attr("event", "tick")
                .with_attr("data", 1),
            Node::new("sse.send")
                .with_attr("event", "tick")
                .with_attr("id", "2")
                .with_attr("data", 2),
        ]),
    ));
    state.build_routes(&root).await.unwrap();

    let response = app(&state).oneshot(get_request("/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert_eq!(text, "event: tick\ndata: 1\n\nid: 2\nevent: tick\ndata: 2\n\n");
}

#[tokio::test]
async fn test_redirect_and_headers() {
    let state = state();
    let root = Node::new("root").with_child(get(
        "/old",
        block([
            Node::new("http.header")
                .with_attr("name", "x-trace")
                .with_attr("value", "abc"),
            Node::new("http.redirect").with_value("/new"),
        ]),
    ));
    state.build_routes(&root).await.unwrap();

    let response = app(&state).oneshot(get_request("/old")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/new");
    assert_eq!(response.headers()["x-trace"], "abc");
}

// ============================================================================
// Test: Hot swap and admin
// ============================================================================

#[tokio::test]
async fn test_rebuild_swaps_routes() {
    let state = state();
    let app = app(&state);

    state
        .build_routes(&Node::new("root").with_child(get("/v", block([respond(200, "one")]))))
        .await
        .unwrap();
    assert_eq!(send(&app, get_request("/v")).await.1, "one");

    state
        .build_routes(&Node::new("root").with_child(get("/v", block([respond(200, "two")]))))
        .await
        .unwrap();
    assert_eq!(send(&app, get_request("/v")).await.1, "two");
}

#[tokio::test]
async fn test_in_flight_request_finishes_on_its_table() {
    let state = state();
    let app = app(&state);

    state
        .build_routes(&Node::new("root").with_child(get(
            "/v",
            block([Node::new("sleep").with_value("300ms"), respond(200, "one")]),
        )))
        .await
        .unwrap();

    let in_flight = tokio::spawn({
        let app = app.clone();
        async move { send(&app, get_request("/v")).await }
    });
    // Let the request reach the sleeping handler before swapping.
    tokio::time::sleep(Duration::from_millis(100)).await;

    state
        .build_routes(&Node::new("root").with_child(get("/v", block([respond(200, "two")]))))
        .await
        .unwrap();

    assert_eq!(send(&app, get_request("/v")).await.1, "two");
    assert_eq!(in_flight.await.unwrap(), (StatusCode::OK, "one".to_string()));
}

#[tokio::test]
async fn test_admin_requires_token() {
    let state = state();
    state
        .build_routes(&Node::new("root").with_child(
            Node::new("http.get")
                .with_value("/users/{id}")
                .with_attr("summary", "Fetch a user")
                .with_child(block([respond(200, "$id")])),
        ))
        .await
        .unwrap();
    let admin = AdminConfig {
        enabled: true,
        token: Some("admin-secret".into()),
        ..AdminConfig::default()
    };
    let app = build_router(state.clone(), &admin);

    let (status, _) = send(&app, get_request("/admin/routes")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get("/admin/routes")
        .header("X-Admin-Token", "admin-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(json["routes"][0]["path"], "/users/{id}");
    assert_eq!(json["routes"][0]["summary"], "Fetch a user");

    let request = Request::get("/admin/slots")
        .header("X-Admin-Token", "admin-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("http.get"));

    let request = Request::post("/admin/reload")
        .header("X-Admin-Token", "admin-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body.contains("no program loaded"));
}
