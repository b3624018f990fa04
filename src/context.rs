//! Pooled per-request context.
//!
//! Every middleware in this crate shares one per-request value bag: ad hoc
//! key/value storage, accumulated log fields, the request and trace ids,
//! the recorded error, and an optional session view. The bag is acquired
//! from an object pool when the request enters [`ContextLayer`], travels
//! through the stack inside the request extensions as a cheap-clone
//! [`RequestContext`] handle, and is cleared and returned to the pool once
//! the response is produced.
//!
//! # Handler Access
//!
//! `RequestContext` implements `FromRequestParts`, so handlers take it as
//! an ordinary extractor:
//!
//! ```rust,ignore
//! async fn create_order(ctx: RequestContext, Json(req): Json<CreateOrder>) -> Response {
//!     ctx.add_log_field("order_kind", json!(req.kind));
//!     match place_order(req).await {
//!         Ok(order) => ctx.success(Some(json!(order))),
//!         Err(err) => ctx.fail_any(&err),
//!     }
//! }
//! ```
//!
//! # Pool Semantics
//!
//! A bag is recycled only when the layer holds the last reference after the
//! response; a handler that keeps a clone alive past the request simply
//! strands that bag and the pool allocates a fresh one next time. Bags keep
//! their allocated capacity across reuse.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Request, Response as HttpResponse, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde_json::Value;
use tower::{Layer, Service};
use tracing::error;

use crate::config::{Config, Env};
use crate::error::{ApiError, translate};
use crate::response::Envelope;
use crate::session::Session;

/// Static knobs shared by every request context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Deployment environment, controls error masking.
    pub env: Env,
    /// Application name (attached to log records).
    pub application: String,
    /// Internal-facing services render unmasked system errors.
    pub internal: bool,
    /// Override code for translated system errors.
    pub system_error_code: Option<String>,
}

impl From<&Config> for ContextConfig {
    fn from(config: &Config) -> Self {
        Self {
            env: config.env,
            application: config.application.clone(),
            internal: config.internal,
            system_error_code: config.system_error_code.clone(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            env: Env::Development,
            application: "app".to_string(),
            internal: false,
            system_error_code: None,
        }
    }
}

/// The per-request value bag.
#[derive(Debug, Default)]
struct ContextBag {
    values: HashMap<String, Value>,
    log_fields: Vec<(String, Value)>,
    log_context_keys: Vec<String>,
    log_session_keys: Vec<String>,
    error: Option<ApiError>,
    request_id: Option<String>,
    trace_id: Option<String>,
    session: Option<Session>,
    started_at: Option<Instant>,
}

impl ContextBag {
    /// Clear request-scoped state, keeping allocated capacity.
    fn reset(&mut self) {
        self.values.clear();
        self.log_fields.clear();
        self.log_context_keys.clear();
        self.log_session_keys.clear();
        self.error = None;
        self.request_id = None;
        self.trace_id = None;
        self.session = None;
        self.started_at = None;
    }
}

/// Cheap-clone handle to the per-request bag.
#[derive(Clone)]
pub struct RequestContext {
    bag: Arc<Mutex<ContextBag>>,
    config: Arc<ContextConfig>,
}

impl RequestContext {
    /// Create a standalone context (tests, one-off tasks outside the pool).
    pub fn standalone(config: ContextConfig) -> Self {
        Self {
            bag: Arc::new(Mutex::new(ContextBag::default())),
            config: Arc::new(config),
        }
    }

    /// The static configuration this context was created with.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    // =========================================================================
    // Key/Value Storage
    // =========================================================================

    /// Store a cross-middleware value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.bag.lock().values.insert(key.into(), value);
    }

    /// Fetch a cross-middleware value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.lock().values.get(key).cloned()
    }

    // =========================================================================
    // Log Field Accumulation
    // =========================================================================

    /// Append a structured field to the request's log record.
    pub fn add_log_field(&self, key: impl Into<String>, value: Value) {
        self.bag.lock().log_fields.push((key.into(), value));
    }

    /// Snapshot of the accumulated log fields.
    pub fn log_fields(&self) -> Vec<(String, Value)> {
        self.bag.lock().log_fields.clone()
    }

    /// Ask the logger to include these context values in the log record.
    pub fn add_log_context_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut bag = self.bag.lock();
        bag.log_context_keys.extend(keys.into_iter().map(Into::into));
    }

    /// Context keys the logger should include.
    pub fn log_context_keys(&self) -> Vec<String> {
        self.bag.lock().log_context_keys.clone()
    }

    /// Ask the logger to include these session values in the log record.
    pub fn add_log_session_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut bag = self.bag.lock();
        bag.log_session_keys.extend(keys.into_iter().map(Into::into));
    }

    /// Session keys the logger should include.
    pub fn log_session_keys(&self) -> Vec<String> {
        self.bag.lock().log_session_keys.clone()
    }

    // =========================================================================
    // Identifiers, Session, Timing
    // =========================================================================

    /// Set the request id (trace middleware).
    pub fn set_request_id(&self, id: impl Into<String>) {
        self.bag.lock().request_id = Some(id.into());
    }

    /// The request id, when the trace middleware has run.
    pub fn request_id(&self) -> Option<String> {
        self.bag.lock().request_id.clone()
    }

    /// Set the trace id (trace middleware).
    pub fn set_trace_id(&self, id: impl Into<String>) {
        self.bag.lock().trace_id = Some(id.into());
    }

    /// The trace id, when the trace middleware has run.
    pub fn trace_id(&self) -> Option<String> {
        self.bag.lock().trace_id.clone()
    }

    /// Attach the established session view (host session layer).
    pub fn set_session(&self, session: Session) {
        self.bag.lock().session = Some(session);
    }

    /// The session view, when one was attached.
    pub fn session(&self) -> Option<Session> {
        self.bag.lock().session.clone()
    }

    /// Record when request processing started.
    pub fn mark_start(&self) {
        self.bag.lock().started_at = Some(Instant::now());
    }

    /// Milliseconds since [`mark_start`](Self::mark_start).
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.bag
            .lock()
            .started_at
            .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    // =========================================================================
    // Error Recording and Response Helpers
    // =========================================================================

    /// Record the request's error for the logger and tracer.
    pub fn record_error(&self, err: &ApiError) {
        self.bag.lock().error = Some(err.clone());
    }

    /// The recorded error, if any middleware or handler failed the request.
    pub fn recorded_error(&self) -> Option<ApiError> {
        self.bag.lock().error.clone()
    }

    /// Render a success envelope with the request id attached.
    pub fn success(&self, data: Option<Value>) -> Response {
        let mut envelope = Envelope::success(data);
        if let Some(rid) = self.request_id() {
            envelope = envelope.with_rid(rid);
        }
        envelope.into_response()
    }

    /// Record an error and render its envelope.
    ///
    /// System error messages are masked per the context configuration; the
    /// HTTP status follows the error's default mapping.
    pub fn fail(&self, err: ApiError) -> Response {
        self.fail_with_status(err, None)
    }

    /// Record a heterogeneous error, translating it first.
    pub fn fail_any(&self, err: &anyhow::Error) -> Response {
        let translated = translate(err, self.config.system_error_code.as_deref());
        if translated.system && self.config.env != Env::Production {
            // Full detail on the console in development; production relies
            // on the request log.
            error!(error = %err, code = %translated.code, "request failed");
        }
        self.fail(translated)
    }

    /// Record an error and render its envelope with an explicit status.
    pub fn fail_with_status(&self, err: ApiError, status: Option<StatusCode>) -> Response {
        self.record_error(&err);

        let message = err
            .public_message(self.config.env, self.config.internal)
            .to_string();
        let mut envelope = Envelope::from_error(&err, message);
        if let Some(status) = status {
            envelope = envelope.with_status(status);
        }
        if let Some(rid) = self.request_id() {
            envelope = envelope.with_rid(rid);
        }
        envelope.into_response()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Extract the context attached by [`ContextLayer`].
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Envelope;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestContext>().cloned().ok_or_else(|| {
            Envelope::from_error(
                &ApiError::internal("request context not installed"),
                "system error",
            )
        })
    }
}

/// Fetch the context from a request without consuming it.
pub fn context_of<B>(req: &Request<B>) -> Option<RequestContext> {
    req.extensions().get::<RequestContext>().cloned()
}

// =============================================================================
// Pool
// =============================================================================

/// Free-list pool of context bags.
pub struct ContextPool {
    config: Arc<ContextConfig>,
    free: Mutex<Vec<ContextBag>>,
    max_idle: usize,
}

/// Idle bags kept around per pool.
const DEFAULT_MAX_IDLE: usize = 512;

impl ContextPool {
    /// Create a pool handing out contexts with the given configuration.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config: Arc::new(config),
            free: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    /// Take a context for one request.
    pub fn acquire(&self) -> RequestContext {
        let bag = self.free.lock().pop().unwrap_or_default();
        RequestContext {
            bag: Arc::new(Mutex::new(bag)),
            config: self.config.clone(),
        }
    }

    /// Return a context after the response has been produced.
    ///
    /// The bag is reclaimed only when this is the last handle; otherwise it
    /// is left to the straggling owner and dropped with it.
    pub fn recycle(&self, ctx: RequestContext) {
        let RequestContext { bag, .. } = ctx;
        if let Some(mutex) = Arc::into_inner(bag) {
            let mut bag = mutex.into_inner();
            bag.reset();
            let mut free = self.free.lock();
            if free.len() < self.max_idle {
                free.push(bag);
            }
        }
    }

    /// Number of idle bags currently pooled.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("config", &self.config)
            .field("idle", &self.idle())
            .finish()
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Installs a pooled [`RequestContext`] into every request's extensions.
///
/// Must sit outside every middleware that reads the context (trace, logger,
/// auth, signature, rate limit, recover's error rendering).
#[derive(Clone)]
pub struct ContextLayer {
    pool: Arc<ContextPool>,
}

impl ContextLayer {
    /// Create a layer with a fresh pool for the given configuration.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            pool: Arc::new(ContextPool::new(config)),
        }
    }

    /// Create a layer sharing an existing pool.
    pub fn with_pool(pool: Arc<ContextPool>) -> Self {
        Self { pool }
    }

    /// The pool backing this layer.
    pub fn pool(&self) -> Arc<ContextPool> {
        self.pool.clone()
    }
}

impl<S> Layer<S> for ContextLayer {
    type Service = ContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContextService {
            inner,
            pool: self.pool.clone(),
        }
    }
}

/// Service wrapper installing and recycling the context.
#[derive(Clone)]
pub struct ContextService<S> {
    inner: S,
    pool: Arc<ContextPool>,
}

impl<S> Service<Request<Body>> for ContextService<S>
where
    S: Service<Request<Body>, Response = HttpResponse<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = HttpResponse<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let pool = self.pool.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ctx = pool.acquire();
            ctx.mark_start();
            req.extensions_mut().insert(ctx.clone());

            let response = inner.call(req).await?;

            pool.recycle(ctx);
            Ok(response)
        })
    }
}
