//! Outbound HTTP on behalf of a plugin.
//!
//! Every request is checked against the plugin's network patterns, refused
//! for internal addresses and counted against the per-call cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::Permissions;
use zeno_common::{HostFunctionError, RuntimeError};

/// Largest response body handed back to a guest.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// HTTP client for one plugin.
///
/// The counter is reset at the start of every guest call.
pub struct HttpOutboundHost {
    client: Client,
    permissions: Arc<Permissions>,
    request_count: AtomicU32,
}

/// Request as sent by a guest to `host_http_request`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    PermissionDenied(String),
    Timeout,
    ConnectionFailed,
    BodyTooLarge,
    RateLimited,
    Other(String),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::PermissionDenied(resource) => write!(f, "Permission denied: {resource}"),
            HttpError::Timeout => write!(f, "request timed out"),
            HttpError::ConnectionFailed => write!(f, "connection failed"),
            HttpError::BodyTooLarge => write!(f, "response body too large"),
            HttpError::RateLimited => write!(f, "rate limit exceeded for HTTP request"),
            HttpError::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl HttpOutboundHost {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the HTTP client cannot be built.
    pub fn new(permissions: Arc<Permissions>) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("zeno/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::invalid_config(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, permissions))
    }

    pub fn with_client(client: Client, permissions: Arc<Permissions>) -> Self {
        Self {
            client,
            permissions,
            request_count: AtomicU32::new(0),
        }
    }

    /// Perform a request after the permission, SSRF and rate checks.
    ///
    /// # Errors
    ///
    /// Returns the first failed check, or the transport failure.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.permissions.max_http_requests {
            warn!(
                url = %request.url,
                count,
                max = self.permissions.max_http_requests,
                "HTTP rate limit exceeded"
            );
            return Err(HttpError::RateLimited);
        }

        if let Err(denied) = self.permissions.check_network(&request.url) {
            warn!(url = %request.url, "HTTP request blocked");
            return Err(HttpError::PermissionDenied(match denied {
                HostFunctionError::PermissionDenied { resource } => resource,
                other => other.to_string(),
            }));
        }

        debug!(method = ?request.method, url = %request.url, "Executing HTTP request");

        let mut builder = self.client.request(request.method.to_reqwest(), &request.url);
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms.into()));
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else if e.is_connect() {
                HttpError::ConnectionFailed
            } else {
                HttpError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
        {
            return Err(HttpError::BodyTooLarge);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::Other(e.to_string()))?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(HttpError::BodyTooLarge);
        }

        info!(
            url = %request.url,
            status,
            body_size = body.len(),
            "HTTP request completed"
        );

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HttpOutboundHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOutboundHost")
            .field("request_count", &self.request_count())
            .finish_non_exhaustive()
    }
}

impl From<HttpError> for HostFunctionError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::PermissionDenied(resource) => {
                HostFunctionError::PermissionDenied { resource }
            }
            HttpError::RateLimited => HostFunctionError::RateLimitExceeded {
                operation: "HTTP request".into(),
            },
            other => HostFunctionError::Backend {
                operation: "http_request".into(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(network: &[&str], max_http_requests: u32) -> HttpOutboundHost {
        let perms = Permissions {
            network: network.iter().map(|s| (*s).to_string()).collect(),
            max_http_requests,
            ..Permissions::default()
        };
        HttpOutboundHost::new(Arc::new(perms)).unwrap()
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            url: url.into(),
            headers: vec![],
            body: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_http_method_conversion() {
        assert_eq!(HttpMethod::Get.to_reqwest(), reqwest::Method::GET);
        assert_eq!(HttpMethod::Post.to_reqwest(), reqwest::Method::POST);
        assert_eq!(HttpMethod::Delete.to_reqwest(), reqwest::Method::DELETE);
    }

    #[test]
    fn test_request_from_guest_json() {
        let request: HttpRequest =
            serde_json::from_str(r#"{"method": "POST", "url": "https://a.example/", "body": "x"}"#)
                .unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body.as_deref(), Some("x"));

        let request: HttpRequest = serde_json::from_str(r#"{"url": "https://a.example/"}"#).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
    }

    #[test]
    fn test_request_count() {
        let host = host(&["*"], 10);
        assert_eq!(host.request_count(), 0);
        host.request_count.fetch_add(1, Ordering::SeqCst);
        assert_eq!(host.request_count(), 1);
        host.reset_count();
        assert_eq!(host.request_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let host = host(&["https://api.example.com/*"], 0);
        let result = host.fetch(get("https://api.example.com/get")).await;
        assert!(matches!(result, Err(HttpError::RateLimited)));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let host = host(&["https://allowed.example/*"], 10);
        let result = host.fetch(get("https://blocked.example/path")).await;
        assert!(matches!(result, Err(HttpError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_ssrf_blocked() {
        let host = host(&["*"], 10);
        for url in ["http://localhost:8080/", "http://192.168.1.1/"] {
            let result = host.fetch(get(url)).await;
            assert!(matches!(result, Err(HttpError::PermissionDenied(_))), "{url}");
        }
    }

    #[test]
    fn test_error_conversion() {
        let err: HostFunctionError = HttpError::RateLimited.into();
        assert!(matches!(err, HostFunctionError::RateLimitExceeded { .. }));
        let err: HostFunctionError = HttpError::PermissionDenied("network".into()).into();
        assert!(err.to_string().contains("network"));
    }
}
