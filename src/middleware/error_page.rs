//! Generic error rendering for bare error responses.
//!
//! Router fallbacks and misc rejections (404, 405, extractor failures)
//! produce error statuses with empty bodies. This middleware turns those
//! into the uniform envelope: JSON when the caller sent an `Accept` header,
//! plain status text otherwise. The synthesized error is recorded in the
//! request context so the request log shows it.
//!
//! Responses already rendered by this crate (carrying the
//! [`EnvelopeRendered`](crate::response::EnvelopeRendered) marker) and
//! responses with a body are left untouched.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};

use crate::context::{RequestContext, context_of};
use crate::error::ApiError;
use crate::response::{Envelope, EnvelopeRendered};

/// Error-page layer for the Tower middleware stack.
#[derive(Clone, Default)]
pub struct ErrorPageLayer;

impl ErrorPageLayer {
    /// Create a new error-page layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ErrorPageLayer {
    type Service = ErrorPageService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorPageService { inner }
    }
}

/// Error-page service wrapper.
#[derive(Clone)]
pub struct ErrorPageService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for ErrorPageService<S>
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
        // Captured up front; the request is consumed by the inner service.
        let wants_json = req
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().is_empty());
        let ctx = context_of(&req);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;

            if !needs_rendering(&response) {
                return Ok(response);
            }

            Ok(render_status(response, wants_json, ctx.as_ref()))
        })
    }
}

/// A response needs rendering when it has an error status, was not produced
/// by this crate's renderer, and carries no body of its own.
fn needs_rendering(response: &Response<Body>) -> bool {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return false;
    }
    if response.extensions().get::<EnvelopeRendered>().is_some() {
        return false;
    }

    // Bare rejections either omit content-length or set it to zero.
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        == 0
}

/// Replace a bare error response with the uniform envelope.
fn render_status(
    response: Response<Body>,
    wants_json: bool,
    ctx: Option<&RequestContext>,
) -> Response<Body> {
    let status = response.status();
    let text = status.canonical_reason().unwrap_or("error");
    let code = status.as_u16().to_string();

    if let Some(ctx) = ctx
        && ctx.recorded_error().is_none()
    {
        let err = if status.is_server_error() {
            ApiError::system(code.clone(), text)
        } else {
            ApiError::new(code.clone(), text)
        };
        ctx.record_error(&err);
    }

    let mut envelope = if wants_json {
        Envelope::error(code, text).with_status(status)
    } else {
        Envelope::text(code, text).with_status(status)
    };
    if let Some(rid) = ctx.and_then(|c| c.request_id()) {
        envelope = envelope.with_rid(rid);
    }
    envelope.into_response()
}
