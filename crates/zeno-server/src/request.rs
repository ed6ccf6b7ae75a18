//! Request ingestion.
//!
//! Turns an incoming request into the values a route body sees: query
//! string, headers, form fields, a JSON body and the client address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method};
use axum_extra::extract::Multipart;
use serde_json::Value as Json;
use zeno_core::{Value, ValueMap};

/// Ingestion failures the pipeline answers before running the route.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed form data: {0}")]
    BadForm(String),
}

/// Everything the route body can observe about the request.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub method: Method,
    pub url: String,
    pub path: String,
    pub headers: HeaderMap,
    pub query: ValueMap,
    pub form: ValueMap,
    /// Parsed JSON object body; an empty map when absent, malformed or not
    /// an object.
    pub body: Value,
    pub client_ip: Option<IpAddr>,
}

impl RequestData {
    /// Read and decode the request.
    ///
    /// # Errors
    ///
    /// Returns `TooLarge` when the body exceeds `max_body_bytes` and
    /// `BadForm` for undecodable multipart content.
    pub async fn ingest(request: Request, max_body_bytes: usize) -> Result<Self, IngestError> {
        let (parts, body) = request.into_parts();
        let client_ip = client_ip(&parts.headers, parts.extensions.get::<ConnectInfo<SocketAddr>>());
        let bytes = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(|_| IngestError::TooLarge {
                limit: max_body_bytes,
            })?;

        let query = parts
            .uri
            .query()
            .map(|q| decode_pairs(q.as_bytes()))
            .unwrap_or_default();

        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut form = ValueMap::new();
        let mut json = Value::Map(ValueMap::new());
        if content_type.starts_with("multipart/form-data") {
            let request = Request::builder()
                .header(CONTENT_TYPE, parts.headers[CONTENT_TYPE].clone())
                .body(Body::from(bytes.clone()))
                .map_err(|e| IngestError::BadForm(e.to_string()))?;
            form = decode_multipart(request).await?;
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            form = decode_pairs(&bytes);
        } else if content_type.contains("json")
            && matches!(parts.method, Method::POST | Method::PUT | Method::PATCH)
        {
            if let Ok(parsed @ Json::Object(_)) = serde_json::from_slice::<Json>(&bytes) {
                json = Value::from_json(parsed);
            }
        }

        Ok(Self {
            method: parts.method,
            url: parts.uri.to_string(),
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            query,
            form,
            body: json,
            client_ip,
        })
    }

    /// Header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Bearer token from the `Authorization` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
    }

    /// The `request` map bound into the route scope.
    pub fn to_value(&self, params: &ValueMap) -> Value {
        let mut headers = ValueMap::new();
        for (name, value) in &self.headers {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), Value::from(value));
            }
        }
        let mut map = ValueMap::new();
        map.insert("method".into(), Value::from(self.method.as_str()));
        map.insert("url".into(), Value::from(self.url.as_str()));
        map.insert("path".into(), Value::from(self.path.as_str()));
        map.insert("headers".into(), Value::Map(headers));
        map.insert("query".into(), Value::Map(self.query.clone()));
        map.insert("body".into(), self.body.clone());
        map.insert("params".into(), Value::Map(params.clone()));
        if let Some(ip) = self.client_ip {
            map.insert("ip".into(), Value::from(ip.to_string()));
        }
        Value::Map(map)
    }
}

/// Forwarding headers win over the socket address.
fn client_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .and_then(|v| v.trim().parse().ok());
    forwarded.or_else(|| connect.map(|ConnectInfo(addr)| addr.ip()))
}

/// `a=1&b=x` pairs; repeated keys collect into a list.
fn decode_pairs(input: &[u8]) -> ValueMap {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    let mut order = Vec::new();
    for (key, value) in url::form_urlencoded::parse(input) {
        let key = key.into_owned();
        let entry = grouped.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(value.into_owned());
    }
    let mut map = ValueMap::new();
    for key in order {
        let mut values = grouped.remove(&key).unwrap_or_default();
        let value = if values.len() == 1 {
            Value::String(values.remove(0))
        } else {
            Value::List(values.into_iter().map(Value::String).collect())
        };
        map.insert(key, value);
    }
    map
}

async fn decode_multipart(request: Request) -> Result<ValueMap, IngestError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| IngestError::BadForm(e.to_string()))?;
    let mut form = ValueMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IngestError::BadForm(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| IngestError::BadForm(e.to_string()))?;
        let value = match file_name {
            Some(file_name) => {
                let mut file = ValueMap::new();
                file.insert("filename".into(), Value::String(file_name));
                file.insert(
                    "content_type".into(),
                    content_type.map_or(Value::Nil, Value::String),
                );
                file.insert(
                    "size".into(),
                    Value::Int(i64::try_from(data.len()).unwrap_or(i64::MAX)),
                );
                file.insert(
                    "content".into(),
                    Value::String(String::from_utf8_lossy(&data).into_owned()),
                );
                Value::Map(file)
            }
            None => Value::String(String::from_utf8_lossy(&data).into_owned()),
        };
        form.insert(name, value);
    }
    Ok(form)
}
