//! The response writer slots write into.
//!
//! A request's writer buffers status, headers and body until the handler
//! finishes. The first server-sent event commits the head instead: the
//! pipeline is handed a streaming response and later writes are forwarded
//! to the client as they happen. A capture writer only buffers, so
//! `capture` can collect output into a variable.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use zeno_common::RuntimeError;
use zeno_core::Value;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug)]
struct WriterState {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    /// Set once the head has been handed to the client.
    stream: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Destination of everything a request handler emits.
#[derive(Debug)]
pub struct ResponseWriter {
    state: Mutex<WriterState>,
    head: Mutex<Option<oneshot::Sender<Response<Body>>>>,
}

impl ResponseWriter {
    /// A writer for a live request and the receiver that yields the
    /// streaming response if the handler starts one.
    pub fn for_request() -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        let writer = Self {
            state: Mutex::new(WriterState::new()),
            head: Mutex::new(Some(tx)),
        };
        (writer, rx)
    }

    /// A writer that only ever buffers.
    pub fn capture() -> Self {
        Self {
            state: Mutex::new(WriterState::new()),
            head: Mutex::new(None),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    /// # Errors
    ///
    /// Fails for codes outside 100..=999 or once the head has been sent.
    pub fn set_status(&self, code: u16) -> Result<(), RuntimeError> {
        let status = StatusCode::from_u16(code)
            .map_err(|_| RuntimeError::failed(format!("invalid status code {code}")))?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.status = status;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails for malformed header names or values, or once the head has
    /// been sent.
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), RuntimeError> {
        let name = HeaderName::try_from(name)
            .map_err(|e| RuntimeError::failed(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| RuntimeError::failed(format!("invalid value for header '{name}': {e}")))?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.headers.insert(name, value);
        Ok(())
    }

    /// Append raw bytes to the body.
    ///
    /// # Errors
    ///
    /// Fails when the client of a streaming response has gone away.
    pub fn write(&self, bytes: &[u8]) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        match &state.stream {
            Some(stream) => stream
                .send(Bytes::copy_from_slice(bytes))
                .map_err(|_| RuntimeError::io("client disconnected")),
            None => {
                state.body.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Replace the buffered response with `body`, encoded by its type:
    /// maps and lists as JSON, everything else as text.
    ///
    /// # Errors
    ///
    /// Fails once the head has been sent.
    pub fn respond(&self, status: u16, body: &Value) -> Result<(), RuntimeError> {
        self.set_status(status)?;
        let (bytes, content_type) = encode_body(body);
        let mut state = self.state.lock();
        if let Some(content_type) = content_type {
            if !state.headers.contains_key(CONTENT_TYPE) {
                state
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }
        state.body = bytes;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails for unusable locations or once the head has been sent.
    pub fn redirect(&self, location: &str, status: u16) -> Result<(), RuntimeError> {
        self.set_status(status)?;
        self.set_header(LOCATION.as_str(), location)?;
        self.state.lock().body.clear();
        Ok(())
    }

    /// Emit one server-sent event, committing the stream head first.
    ///
    /// # Errors
    ///
    /// Fails when the client has gone away.
    pub fn send_event(
        &self,
        event: Option<&str>,
        data: &str,
        id: Option<&str>,
    ) -> Result<(), RuntimeError> {
        self.start_stream();
        self.write(format_event(event, data, id).as_bytes())
    }

    fn start_stream(&self) {
        let Some(head) = self.head.lock().take() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let buffered = std::mem::take(&mut state.body);
        if !buffered.is_empty() {
            let _ = tx.send(Bytes::from(buffered));
        }
        state.stream = Some(tx);

        let mut headers = std::mem::take(&mut state.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        let body = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
        });
        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = state.status;
        *response.headers_mut() = headers;
        drop(state);

        // The pipeline may already have given up on the request.
        let _ = head.send(response);
    }

    /// Buffered body as text; used by `capture`.
    pub fn take_text(&self) -> String {
        let body = std::mem::take(&mut self.state.lock().body);
        String::from_utf8_lossy(&body).into_owned()
    }

    /// The buffered response.
    pub fn to_response(&self) -> Response<Body> {
        let state = self.state.lock();
        let mut response = Response::new(Body::from(state.body.clone()));
        *response.status_mut() = state.status;
        *response.headers_mut() = state.headers.clone();
        response
    }

    /// Close the event stream, if any.
    pub fn finish(&self) {
        self.state.lock().stream = None;
    }
}

impl WriterState {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            stream: None,
        }
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.stream.is_some() {
            return Err(RuntimeError::failed("response head already sent"));
        }
        Ok(())
    }
}

fn encode_body(body: &Value) -> (Vec<u8>, Option<&'static str>) {
    match body {
        Value::Nil => (Vec::new(), None),
        Value::Map(_) | Value::List(_) => (
            serde_json::to_vec(&body.to_json()).unwrap_or_default(),
            Some(APPLICATION_JSON),
        ),
        other => (other.to_display_string().into_bytes(), Some(TEXT_PLAIN)),
    }
}

fn format_event(event: Option<&str>, data: &str, id: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}
