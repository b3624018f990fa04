//! Structured request logging middleware.
//!
//! Emits one record per request through `tracing` after the inner service
//! completes: method, host, uri, path, latency, status, client ip, query,
//! request body, user agent, configured header/context keys, accumulated
//! context log fields, session id and configured session keys, request id,
//! and trace id. The sink (fmt, JSON, OTLP) is whatever subscriber the
//! host installs.
//!
//! # Path Levels
//!
//! Paths classify to a [`LogLevel`] (memoized):
//!
//! - `Ignore` — no record at all
//! - `Partial` — everything except the response body
//! - `Full` — additionally captures and logs the response body
//!
//! # Severity
//!
//! A request with a recorded system error logs at `error`, a recorded
//! business error at `warn`, everything else at `info`.
//!
//! # Body Capture
//!
//! Request and response bodies are buffered up to the configured cap and
//! restored afterwards, so neither handlers nor clients observe the
//! capture. Non-UTF-8 bodies are logged as a length placeholder.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, header};
use serde_json::{Map, Value, json};
use tower::{Layer, Service};
use tracing::{error, info, warn};

use super::ip::client_ip;
use crate::classify::PathClassifier;
use crate::context::context_of;

/// Log target for request records, so hosts can filter or route them.
pub const LOG_TARGET: &str = "gatekit::request";

/// How much of a request to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// No record for this path.
    Ignore,
    /// Log the request without the response body.
    Partial,
    /// Log the request and the response body.
    Full,
}

/// What the logger captures besides the always-on fields.
#[derive(Debug, Clone)]
struct CaptureConfig {
    ip: bool,
    query: bool,
    body: bool,
    user_agent: bool,
    header_keys: Vec<String>,
    context_keys: Vec<String>,
    session_keys: Vec<String>,
    body_limit: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ip: true,
            query: true,
            body: true,
            user_agent: false,
            header_keys: Vec::new(),
            context_keys: Vec::new(),
            session_keys: Vec::new(),
            body_limit: 64 * 1024,
        }
    }
}

/// Request logging layer for the Tower middleware stack.
#[derive(Clone)]
pub struct RequestLoggerLayer {
    classifier: Arc<PathClassifier<LogLevel>>,
    capture: CaptureConfig,
}

impl Default for RequestLoggerLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLoggerLayer {
    /// Create a logger recording every path without response bodies.
    pub fn new() -> Self {
        Self::with_classifier(PathClassifier::new(LogLevel::Partial))
    }

    /// Create a logger with a custom path classifier.
    pub fn with_classifier(classifier: PathClassifier<LogLevel>) -> Self {
        Self {
            classifier: Arc::new(classifier),
            capture: CaptureConfig::default(),
        }
    }

    /// Toggle client IP capture (default: on).
    pub fn ip(mut self, on: bool) -> Self {
        self.capture.ip = on;
        self
    }

    /// Toggle query string capture (default: on).
    pub fn query(mut self, on: bool) -> Self {
        self.capture.query = on;
        self
    }

    /// Toggle request body capture (default: on).
    pub fn body(mut self, on: bool) -> Self {
        self.capture.body = on;
        self
    }

    /// Toggle user-agent capture (default: off).
    pub fn user_agent(mut self, on: bool) -> Self {
        self.capture.user_agent = on;
        self
    }

    /// Also log these request headers when present.
    pub fn header_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capture.header_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Also log these context values when present.
    pub fn context_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capture.context_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Also log these session values when present.
    pub fn session_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capture.session_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Cap on captured body bytes (default: 64 KiB).
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.capture.body_limit = limit;
        self
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggerService {
            inner,
            classifier: self.classifier.clone(),
            capture: Arc::new(self.capture.clone()),
        }
    }
}

/// Request logging service wrapper.
#[derive(Clone)]
pub struct RequestLoggerService<S> {
    inner: S,
    classifier: Arc<PathClassifier<LogLevel>>,
    capture: Arc<CaptureConfig>,
}

impl<S> Service<Request<Body>> for RequestLoggerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let capture = self.capture.clone();
        let mut inner = self.inner.clone();

        let level = self.classifier.classify(req.uri().path());
        if level == LogLevel::Ignore {
            return Box::pin(async move { inner.call(req).await });
        }

        let started = Instant::now();
        let snapshot = RequestSnapshot::take(&req, &capture);
        let ctx = context_of(&req);

        Box::pin(async move {
            let (req, request_body) = if capture.body {
                buffer_request(req, capture.body_limit).await
            } else {
                (req, None)
            };

            let response = inner.call(req).await?;
            let latency_ms = started.elapsed().as_millis() as u64;
            let status = response.status().as_u16();

            let (response, response_body) = if level == LogLevel::Full {
                buffer_response(response, capture.body_limit).await
            } else {
                (response, None)
            };

            let mut fields = snapshot.into_fields();
            fields.insert("latency".to_string(), json!(latency_ms));
            fields.insert("status".to_string(), json!(status));
            if let Some(body) = request_body {
                fields.insert("body".to_string(), Value::String(body));
            }
            if let Some(body) = response_body {
                fields.insert("response".to_string(), Value::String(body));
            }

            let mut recorded_error = None;
            if let Some(ctx) = ctx {
                for (key, value) in ctx.log_fields() {
                    fields.insert(key, value);
                }
                let context_keys: Vec<String> = capture
                    .context_keys
                    .iter()
                    .cloned()
                    .chain(ctx.log_context_keys())
                    .collect();
                for key in context_keys {
                    if let Some(value) = ctx.get(&key) {
                        fields.insert(key, value);
                    }
                }
                if let Some(session) = ctx.session() {
                    fields.insert("session_id".to_string(), json!(session.id()));
                    let session_keys: Vec<String> = capture
                        .session_keys
                        .iter()
                        .cloned()
                        .chain(ctx.log_session_keys())
                        .collect();
                    for key in session_keys {
                        if let Some(value) = session.get(&key) {
                            fields.insert(key, value.clone());
                        }
                    }
                }
                if let Some(rid) = ctx.request_id() {
                    fields.insert("request_id".to_string(), json!(rid));
                }
                if let Some(tid) = ctx.trace_id() {
                    fields.insert("trace_id".to_string(), json!(tid));
                }
                recorded_error = ctx.recorded_error();
            }

            emit(fields, recorded_error);

            Ok(response)
        })
    }
}

/// Fields that must be read before the request is consumed.
struct RequestSnapshot {
    fields: Map<String, Value>,
}

impl RequestSnapshot {
    fn take(req: &Request<Body>, capture: &CaptureConfig) -> Self {
        let mut fields = Map::new();

        fields.insert("method".to_string(), json!(req.method().as_str()));
        if let Some(host) = header_str(req, header::HOST.as_str()) {
            fields.insert("host".to_string(), json!(host));
        }
        fields.insert("uri".to_string(), json!(req.uri().to_string()));
        fields.insert("path".to_string(), json!(req.uri().path()));

        if capture.ip {
            fields.insert("ip".to_string(), json!(client_ip(req).as_ref()));
        }
        if capture.query {
            fields.insert(
                "query".to_string(),
                json!(req.uri().query().unwrap_or_default()),
            );
        }
        if capture.user_agent
            && let Some(agent) = header_str(req, "user-agent")
        {
            fields.insert("user-agent".to_string(), json!(agent));
        }
        for key in &capture.header_keys {
            if let Some(value) = header_str(req, key) {
                fields.insert(key.clone(), json!(value));
            }
        }

        Self { fields }
    }

    fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

fn header_str(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Declared body size, when the peer sent one.
fn declared_length(headers: &axum::http::HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Buffer the request body up to `limit`, restoring it for the handler.
///
/// Bodies declared larger than the cap are not consumed at all; the record
/// carries a size placeholder instead.
async fn buffer_request(req: Request<Body>, limit: usize) -> (Request<Body>, Option<String>) {
    if let Some(len) = declared_length(req.headers())
        && len > limit
    {
        return (req, Some(format!("<{len} bytes, over capture limit>")));
    }

    let (parts, body) = req.into_parts();
    match to_bytes(body, limit).await {
        Ok(bytes) => {
            let text = render_body(&bytes);
            (Request::from_parts(parts, Body::from(bytes)), text)
        }
        // Undeclared oversize stream or transport error; nothing sane to
        // hand the handler at this point.
        Err(_) => (
            Request::from_parts(parts, Body::empty()),
            Some("<unreadable body>".to_string()),
        ),
    }
}

/// Buffer the response body up to `limit`, restoring it for the client.
async fn buffer_response(
    response: Response<Body>,
    limit: usize,
) -> (Response<Body>, Option<String>) {
    if let Some(len) = declared_length(response.headers())
        && len > limit
    {
        return (response, Some(format!("<{len} bytes, over capture limit>")));
    }

    let (parts, body) = response.into_parts();
    match to_bytes(body, limit).await {
        Ok(bytes) => {
            let text = render_body(&bytes);
            (Response::from_parts(parts, Body::from(bytes)), text)
        }
        Err(_) => (
            Response::from_parts(parts, Body::empty()),
            Some("<unreadable body>".to_string()),
        ),
    }
}

/// Printable form of a captured body.
fn render_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_string()),
        Err(_) => Some(format!("<{} binary bytes>", bytes.len())),
    }
}

/// Emit the record at the severity the recorded error dictates.
fn emit(fields: Map<String, Value>, recorded_error: Option<crate::error::ApiError>) {
    let record = Value::Object(fields);

    match recorded_error {
        Some(err) if err.system => {
            error!(target: LOG_TARGET, error = %err, record = %record, "request");
        }
        Some(err) => {
            warn!(target: LOG_TARGET, error = %err, record = %record, "request");
        }
        None => {
            info!(target: LOG_TARGET, record = %record, "request");
        }
    }
}
