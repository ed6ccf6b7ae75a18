//! Named middleware and the IP blocklist.
//!
//! Logic middleware are slot subtrees defined with `middleware.define`;
//! they run in the request scope before the route body. Native middleware
//! are Rust implementations behind the same names, such as the JWT
//! [`BearerAuth`] registered as `auth`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use zeno_core::{Node, Value};

use crate::request::RequestData;

/// Scope key holding the authenticated principal.
pub const PRINCIPAL_KEY: &str = "auth";

/// Name the JWT middleware is registered under.
pub const AUTH_MIDDLEWARE: &str = "auth";

/// Why a native middleware stopped a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

/// Middleware implemented in Rust.
#[async_trait]
pub trait NativeMiddleware: Send + Sync {
    /// Inspect the request. `Ok(Some(principal))` is bound under
    /// [`PRINCIPAL_KEY`].
    async fn check(&self, request: &RequestData) -> Result<Option<Value>, Rejection>;
}

/// HS256 bearer tokens signed with a shared secret.
pub struct BearerAuth {
    key: DecodingKey,
    validation: Validation,
}

impl BearerAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl NativeMiddleware for BearerAuth {
    async fn check(&self, request: &RequestData) -> Result<Option<Value>, Rejection> {
        let token = request
            .bearer_token()
            .ok_or_else(|| Rejection::unauthorized("missing bearer token"))?;
        let claims = jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "bearer token rejected");
                Rejection::unauthorized("invalid token")
            })?;
        Ok(Some(Value::from_json(claims.claims)))
    }
}

/// A resolved middleware.
#[derive(Clone)]
pub enum Middleware {
    Logic(Arc<Node>),
    Native(Arc<dyn NativeMiddleware>),
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logic(node) => f.debug_tuple("Logic").field(&node.name).finish(),
            Self::Native(_) => f.write_str("Native"),
        }
    }
}

/// Process-wide middleware definitions and blocked addresses.
#[derive(Default)]
pub struct MiddlewareRegistry {
    logic: RwLock<HashMap<String, Arc<Node>>>,
    native: RwLock<HashMap<String, Arc<dyn NativeMiddleware>>>,
    blocked: RwLock<HashSet<IpAddr>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `auth` wired to the JWT secret, when one is set.
    pub fn with_jwt_secret(secret: Option<&str>) -> Self {
        let registry = Self::new();
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            registry.register_native(AUTH_MIDDLEWARE, Arc::new(BearerAuth::new(secret)));
        }
        registry
    }

    /// Define (or redefine) a logic middleware.
    pub fn define(&self, name: impl Into<String>, body: Node) {
        let name = name.into();
        if self.logic.write().insert(name.clone(), Arc::new(body)).is_some() {
            tracing::debug!(middleware = %name, "middleware redefined");
        }
    }

    pub fn register_native(&self, name: impl Into<String>, middleware: Arc<dyn NativeMiddleware>) {
        self.native.write().insert(name.into(), middleware);
    }

    /// Native implementations take precedence over logic definitions.
    pub fn resolve(&self, name: &str) -> Option<Middleware> {
        if let Some(native) = self.native.read().get(name) {
            return Some(Middleware::Native(Arc::clone(native)));
        }
        self.logic
            .read()
            .get(name)
            .map(|node| Middleware::Logic(Arc::clone(node)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .logic
            .read()
            .keys()
            .chain(self.native.read().keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn block_ip(&self, ip: IpAddr) {
        if self.blocked.write().insert(ip) {
            tracing::warn!(%ip, "address blocked");
        }
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.blocked.write().remove(&ip)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.read().contains(&ip)
    }
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("names", &self.names())
            .field("blocked", &self.blocked.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};
    use jsonwebtoken::{EncodingKey, Header};
    use zeno_core::ValueMap;

    fn request_with(token: Option<&str>) -> RequestData {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        RequestData {
            method: Method::GET,
            url: "/".into(),
            path: "/".into(),
            headers,
            query: ValueMap::new(),
            form: ValueMap::new(),
            body: Value::Map(ValueMap::new()),
            client_ip: None,
        }
    }

    fn token(secret: &str) -> String {
        let claims = serde_json::json!({"sub": "ada", "exp": 4_102_444_800_u64});
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let auth = BearerAuth::new("s3cret");

        let principal = auth
            .check(&request_with(Some(&token("s3cret"))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.as_map().unwrap()["sub"], Value::from("ada"));

        let err = auth.check(&request_with(Some(&token("other")))).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(auth.check(&request_with(None)).await.is_err());
    }

    #[test]
    fn test_resolve_prefers_native() {
        let registry = MiddlewareRegistry::with_jwt_secret(Some("k"));
        registry.define("auth", Node::new("do"));
        registry.define("audit", Node::new("do"));

        assert!(matches!(registry.resolve("auth"), Some(Middleware::Native(_))));
        assert!(matches!(registry.resolve("audit"), Some(Middleware::Logic(_))));
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.names(), ["audit", "auth"]);
    }

    #[test]
    fn test_no_secret_no_auth() {
        let registry = MiddlewareRegistry::with_jwt_secret(Some(""));
        assert!(registry.resolve(AUTH_MIDDLEWARE).is_none());
    }

    #[test]
    fn test_blocklist() {
        let registry = MiddlewareRegistry::new();
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        assert!(!registry.is_blocked(ip));
        registry.block_ip(ip);
        assert!(registry.is_blocked(ip));
        assert!(registry.unblock_ip(ip));
        assert!(!registry.is_blocked(ip));
    }
}
