//! HTTP server implementation.
//!
//! [`ZenoServer`] wraps the [`AppState`] in the outer router: health and
//! readiness probes, the admin API when a token is configured, and a
//! fallback that hands every other request to the hot router.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use zeno_common::{AdminConfig, RuntimeError, ServerConfig};

use crate::admin::{AdminState, build_admin_router};
use crate::state::AppState;

/// Build the outer router around `state`.
pub fn build_router(state: AppState, admin: &AdminConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    if state.live_reload().is_some() {
        router = router.route(crate::livereload::ENDPOINT, get(crate::livereload::events));
    }

    if admin.is_configured() {
        if let Some(token) = &admin.token {
            let admin_state = AdminState {
                app_state: state.clone(),
                admin_token: token.clone(),
            };
            router = router.nest(&admin.prefix, build_admin_router(admin_state));
        }
    }

    router
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.ready().await;
    Json(serde_json::json!({
        "status": "ready",
        "routes": status.routes,
        "plugins": status.plugins,
        "arenas": status.arenas,
    }))
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    state.hot_router().dispatch(request).await
}

/// Zeno HTTP server.
pub struct ZenoServer {
    state: AppState,
    server: ServerConfig,
    admin: AdminConfig,
}

impl ZenoServer {
    pub fn new(state: AppState, server: ServerConfig, admin: AdminConfig) -> Self {
        Self {
            state,
            server,
            admin,
        }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` is cancelled or a signal arrives.
    ///
    /// Active connections get `graceful_shutdown_secs` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        let addr = self.server.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind {addr}: {e}")))?;
        info!(addr = %addr, env = %self.server.app_env, "Starting HTTP server");

        let app = build_router(self.state, &self.admin);
        let grace = Duration::from_secs(self.server.graceful_shutdown_secs);
        let stop = shutdown.clone();
        let signals = tokio::spawn(async move {
            tokio::select! {
                () = shutdown_signal() => stop.cancel(),
                () = stop.cancelled() => {}
            }
        });

        let drained = shutdown.clone();
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { drained.cancelled().await });
        let mut serve = std::pin::pin!(serve.into_future());

        let result = tokio::select! {
            result = &mut serve => result,
            () = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace_secs = grace.as_secs(), "Connections still open after grace period");
                Ok(())
            }
        };
        signals.abort();
        result.map_err(|e| RuntimeError::io(format!("Server error: {e}")))?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(state: AppState, admin: &AdminConfig) -> Result<TestHandle, RuntimeError> {
        let app = build_router(state.clone(), admin);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use tower::ServiceExt;
    use zeno_core::Engine;

    use crate::handler::PipelineSettings;
    use crate::middleware::MiddlewareRegistry;
    use crate::state::BuildOptions;

    fn state() -> AppState {
        AppState::new(
            Engine::new(),
            Arc::new(MiddlewareRegistry::new()),
            PipelineSettings::default(),
            BuildOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = build_router(state(), &AdminConfig::default());

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        let body = axum::body::to_bytes(ready.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["routes"], 0);
        assert_eq!(json["arenas"]["in_use"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = build_router(state(), &AdminConfig::default());
        let response = app
            .oneshot(Request::get("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_absent_without_token() {
        let app = build_router(state(), &AdminConfig::default());
        let response = app
            .oneshot(Request::get("/admin/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_test_serves_health() {
        let handle = ZenoServer::start_test(state(), &AdminConfig::default())
            .await
            .unwrap();
        assert!(handle.url().starts_with("http://127.0.0.1:"));
        handle.shutdown().await;
    }
}
