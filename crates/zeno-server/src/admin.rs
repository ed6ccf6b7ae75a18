//! Admin API handlers for runtime management.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `POST /admin/reload` - Re-load the program and swap in its routes
//! - `GET /admin/routes` - Route documentation
//! - `GET /admin/slots` - Slot documentation
//! - `GET /admin/plugins` - Loaded plugins
//! - `POST /admin/plugins/reload` - Reload every plugin
//! - `POST /admin/plugins/:name/reload` - Reload one plugin

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};
use zeno_common::RuntimeError;

use crate::handler::error_response;
use crate::state::AppState;

/// Header carrying the admin token.
pub const TOKEN_HEADER: &str = "X-Admin-Token";

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    pub app_state: AppState,
    pub admin_token: String,
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/reload", post(reload_program))
        .route("/routes", get(list_routes))
        .route("/slots", get(list_slots))
        .route("/plugins", get(list_plugins))
        .route("/plugins/reload", post(reload_plugins))
        .route("/plugins/:name/reload", post(reload_plugin))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let Some(token) = headers.get(TOKEN_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Missing X-Admin-Token header",
        ));
    };
    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

fn failure(e: &RuntimeError) -> Response {
    let status = match e {
        RuntimeError::Plugin { reason, .. } if reason == "not loaded" => StatusCode::NOT_FOUND,
        RuntimeError::InvalidConfig { .. }
        | RuntimeError::Static { .. }
        | RuntimeError::Syntax { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

/// Re-load the program tree and hot-swap its routes.
///
/// # Response
///
/// ```json
/// { "routes": 12, "message": "Routes reloaded" }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn reload_program(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    match admin_state.app_state.reload().await {
        Ok(routes) => {
            info!(routes, "program reloaded");
            Json(serde_json::json!({
                "routes": routes,
                "message": "Routes reloaded"
            }))
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "program reload failed");
            failure(&e)
        }
    }
}

/// Route documentation for the installed table.
#[instrument(skip(admin_state, headers))]
pub async fn list_routes(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    let routes = admin_state.app_state.hot_router().table().docs();
    let count = routes.len();
    Json(serde_json::json!({ "routes": routes, "count": count })).into_response()
}

/// Metadata of every registered slot, keyed by name.
#[instrument(skip(admin_state, headers))]
pub async fn list_slots(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    Json(admin_state.app_state.engine().documentation()).into_response()
}

#[instrument(skip(admin_state, headers))]
pub async fn list_plugins(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    let plugins = match admin_state.app_state.plugins() {
        Some(manager) => manager.list().await,
        None => Vec::new(),
    };
    let count = plugins.len();
    Json(serde_json::json!({ "plugins": plugins, "count": count })).into_response()
}

#[instrument(skip(admin_state, headers))]
pub async fn reload_plugins(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    let Some(manager) = admin_state.app_state.plugins() else {
        return error_response(StatusCode::NOT_FOUND, "Plugins are disabled");
    };
    match manager.reload_all().await {
        Ok(()) => Json(serde_json::json!({
            "plugins": manager.len().await,
            "message": "Plugins reloaded"
        }))
        .into_response(),
        Err(e) => failure(&e),
    }
}

#[instrument(skip(admin_state, headers))]
pub async fn reload_plugin(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e;
    }
    let Some(manager) = admin_state.app_state.plugins() else {
        return error_response(StatusCode::NOT_FOUND, "Plugins are disabled");
    };
    match manager.reload(&name).await {
        Ok(()) => Json(serde_json::json!({
            "plugin": name,
            "message": "Plugin reloaded"
        }))
        .into_response(),
        Err(e) => failure(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "secret".parse().unwrap());

        let result = verify_token(&headers, "secret");
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_token_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "wrong".parse().unwrap());

        let result = verify_token(&headers, "secret");
        assert_eq!(result.unwrap_err().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_verify_token_prefix_is_not_enough() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "secre".parse().unwrap());

        assert!(verify_token(&headers, "secret").is_err());
    }

    #[test]
    fn test_verify_token_missing() {
        let headers = HeaderMap::new();

        let result = verify_token(&headers, "secret");
        assert_eq!(result.unwrap_err().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_failure_status() {
        let missing = RuntimeError::plugin("x", "not loaded");
        assert_eq!(failure(&missing).status(), StatusCode::NOT_FOUND);

        let bad = RuntimeError::invalid_config("no program loaded");
        assert_eq!(failure(&bad).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
