//! Trace-context middleware.
//!
//! - Propagates `X-Request-Id` from the caller, generating a UUIDv4 when
//!   absent, and echoes it on the response
//! - Generates a trace id and stores both ids in the request context for
//!   the logger and the response envelopes (`rid`)
//! - Opens a `tracing` span carrying both ids around the rest of the stack
//! - When the request ends with a recorded error, emits it on the span:
//!   business errors as warnings, system errors as errors
//!
//! Span exporters (OTLP, Jaeger, plain fmt) are the host's choice via its
//! `tracing` subscriber; this middleware only creates the spans.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Instrument, error, info_span, warn};
use uuid::Uuid;

use crate::context::context_of;

/// Header name for request id propagation.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fallback header value when request ID parsing fails.
/// Using `from_static` avoids runtime parsing and is infallible.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Trace-context layer for the Tower middleware stack.
#[derive(Clone, Default)]
pub struct TraceContextLayer;

impl TraceContextLayer {
    /// Create a new trace-context layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TraceContextLayer {
    type Service = TraceContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceContextService { inner }
    }
}

/// Trace-context service wrapper.
#[derive(Clone)]
pub struct TraceContextService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TraceContextService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate_request_id(&req);
        let trace_id = Uuid::new_v4().simple().to_string();

        // Downstream handlers may read the id straight off the headers.
        req.headers_mut().insert(
            REQUEST_ID_HEADER,
            request_id
                .parse()
                .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone()),
        );

        let ctx = context_of(&req);
        if let Some(ref ctx) = ctx {
            ctx.set_request_id(request_id.as_str());
            ctx.set_trace_id(trace_id.as_str());
        }

        let span = info_span!(
            "request",
            path = %req.uri().path(),
            request_id = %request_id,
            trace_id = %trace_id,
        );

        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;

                if let Some(err) = ctx.as_ref().and_then(|c| c.recorded_error()) {
                    if err.system {
                        error!(code = %err.code, error = %err.message, "request errored");
                    } else {
                        warn!(code = %err.code, error = %err.message, "request rejected");
                    }
                }

                response.headers_mut().insert(
                    REQUEST_ID_HEADER,
                    request_id
                        .parse()
                        .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone()),
                );

                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Extract the propagated request id or generate a new one.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
    {
        return value.to_string();
    }

    Uuid::new_v4().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextLayer, RequestContext};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_existing_request_id_propagated() {
        let req = Request::builder()
            .header("x-request-id", "corr-77")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_or_generate_request_id(&req), "corr-77");
    }

    #[test]
    fn test_generated_request_id_is_uuid() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let id = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_response_carries_request_id() {
        let svc = TraceContextLayer::new().layer(tower::service_fn(
            |_req: Request<Body>| async move {
                Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
            },
        ));

        let response = svc
            .oneshot(
                Request::builder()
                    .header("x-request-id", "corr-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "corr-42"
        );
    }

    #[tokio::test]
    async fn test_ids_stored_in_context() {
        let stack = tower::ServiceBuilder::new()
            .layer(ContextLayer::new(ContextConfig::default()))
            .layer(TraceContextLayer::new())
            .service(tower::service_fn(|req: Request<Body>| async move {
                let ctx = req.extensions().get::<RequestContext>().cloned().unwrap();
                assert_eq!(ctx.request_id(), Some("corr-9".to_string()));
                assert!(ctx.trace_id().is_some());
                Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
            }));

        let response = stack
            .oneshot(
                Request::builder()
                    .header("x-request-id", "corr-9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
