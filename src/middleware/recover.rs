//! Panic recovery middleware.
//!
//! A panicking handler must not tear down the connection task: the panic is
//! caught, recorded in the request context as a system error (code `101`),
//! and rendered as a 500 envelope. Outside production the panic payload is
//! also written to the console log.
//!
//! Sits outside the traffic-control layers (whose Authorizer/Signer
//! implementations are host code) but inside the logger, so a panicking
//! request still produces a request record.

use std::any::Any;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tower::{Layer, Service};
use tracing::error;

use crate::config::Env;
use crate::context::{RequestContext, context_of};
use crate::error::ApiError;
use crate::response::Envelope;

/// Panic recovery layer for the Tower middleware stack.
#[derive(Clone)]
pub struct RecoverLayer {
    env: Env,
}

impl RecoverLayer {
    /// Create a recovery layer for the given environment.
    pub fn new(env: Env) -> Self {
        Self { env }
    }
}

impl<S> Layer<S> for RecoverLayer {
    type Service = RecoverService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoverService {
            inner,
            env: self.env,
        }
    }
}

/// Panic recovery service wrapper.
#[derive(Clone)]
pub struct RecoverService<S> {
    inner: S,
    env: Env,
}

impl<S> Service<Request<Body>> for RecoverService<S>
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
        let env = self.env;
        let ctx = context_of(&req);
        let path = req.uri().path().to_string();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Ok(render_panic(panic, env, ctx.as_ref(), &path)),
            }
        })
    }
}

/// Build the 500 envelope for a caught panic.
fn render_panic(
    panic: Box<dyn Any + Send>,
    env: Env,
    ctx: Option<&RequestContext>,
    path: &str,
) -> Response<Body> {
    let detail = panic_message(panic.as_ref());
    let err = ApiError::handler(&detail);

    if env != Env::Production {
        error!(path = %path, panic = %detail, "recovered from panic");
    }

    match ctx {
        Some(ctx) => ctx.fail_with_status(err, Some(StatusCode::INTERNAL_SERVER_ERROR)),
        None => Envelope::from_error(&err, "system error")
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
    }
}

/// Best-effort extraction of the panic payload message.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextLayer};
    use axum::body::to_bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_panic_becomes_500_envelope() {
        let svc = RecoverLayer::new(Env::Development).layer(tower::service_fn(
            |_req: Request<Body>| async move {
                panic!("boom in handler");
                #[allow(unreachable_code)]
                Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
            },
        ));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], crate::error::CODE_HANDLER);
        assert_eq!(json["system"], true);
        assert!(json["message"].as_str().unwrap().contains("boom in handler"));
    }

    #[tokio::test]
    async fn test_panic_recorded_in_context() {
        let layer = ContextLayer::new(ContextConfig::default());
        let pool = layer.pool();

        let stack = tower::ServiceBuilder::new()
            .layer(layer)
            .layer(RecoverLayer::new(Env::Development))
            .service(tower::service_fn(|_req: Request<Body>| async move {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
            }));

        let response = stack
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The bag went back to the pool after the response was rendered.
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_healthy_requests_pass_through() {
        let svc = RecoverLayer::new(Env::Production).layer(tower::service_fn(
            |_req: Request<Body>| async move {
                Ok::<_, std::convert::Infallible>(Response::new(Body::from("ok")))
            },
        ));

        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
