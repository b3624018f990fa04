//! Bearer-token authorization middleware.
//!
//! Token verification itself lives behind the [`Authorizer`] trait — a JWT
//! validator, an introspection endpoint client, a static shared secret;
//! this middleware only extracts the token and routes the decision.
//!
//! # Path Levels
//!
//! Each path classifies to an [`AuthLevel`] (memoized, see
//! [`PathClassifier`]):
//!
//! - `Ignore` — the authorizer is never consulted
//! - `Optional` — the authorizer runs (it may stash identity in the
//!   context), but a failure does not reject the request
//! - `Verify` — a failure rejects the request with a 401 envelope
//!
//! The default level is `Verify`: a path not explicitly opened stays
//! protected.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::debug;

use crate::classify::PathClassifier;
use crate::context::{RequestContext, context_of};
use crate::error::ApiError;
use crate::response::Envelope;

/// Default header carrying the bearer token.
pub const DEFAULT_TOKEN_HEADER: &str = "authorization";

/// Default prefix stripped from the token value.
pub const DEFAULT_TOKEN_PREFIX: &str = "Bearer ";

/// Error code for missing/invalid bearer tokens.
pub const CODE_UNAUTHORIZED: &str = "1101";

/// How strictly a path is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// Skip authorization entirely.
    Ignore,
    /// Run the authorizer but continue on failure.
    Optional,
    /// Reject the request when authorization fails.
    Verify,
}

/// Pluggable token verifier.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Verify the extracted token.
    ///
    /// Implementations typically stash the resolved identity in the
    /// context (`ctx.set("user_id", ...)`) for handlers and the logger.
    async fn authorize(&self, token: &str, ctx: Option<&RequestContext>) -> Result<(), ApiError>;
}

/// Constant-time comparison against a single static token.
///
/// Suitable for service-to-service calls sharing one secret; anything
/// multi-tenant wants a real [`Authorizer`] implementation.
pub struct StaticTokenAuthorizer {
    token: String,
}

impl StaticTokenAuthorizer {
    /// Create an authorizer accepting exactly `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, token: &str, _ctx: Option<&RequestContext>) -> Result<(), ApiError> {
        let matches: bool = token
            .as_bytes()
            .ct_eq(self.token.as_bytes())
            .into();
        if matches {
            Ok(())
        } else if token.is_empty() {
            Err(ApiError::new(CODE_UNAUTHORIZED, "token required"))
        } else {
            Err(ApiError::new(CODE_UNAUTHORIZED, "invalid token"))
        }
    }
}

/// Shared middleware state, frozen when the layer wraps a service.
struct BearerAuthShared {
    authorizer: Arc<dyn Authorizer>,
    classifier: Arc<PathClassifier<AuthLevel>>,
    token_header: String,
    token_prefix: String,
}

/// Bearer-token authorization layer for the Tower middleware stack.
#[derive(Clone)]
pub struct BearerAuthLayer {
    authorizer: Arc<dyn Authorizer>,
    classifier: Arc<PathClassifier<AuthLevel>>,
    token_header: String,
    token_prefix: String,
}

impl BearerAuthLayer {
    /// Create a layer protecting every path (`Verify` default).
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self::with_classifier(authorizer, PathClassifier::new(AuthLevel::Verify))
    }

    /// Create a layer with a custom path classifier.
    pub fn with_classifier(
        authorizer: Arc<dyn Authorizer>,
        classifier: PathClassifier<AuthLevel>,
    ) -> Self {
        Self {
            authorizer,
            classifier: Arc::new(classifier),
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            token_prefix: DEFAULT_TOKEN_PREFIX.to_string(),
        }
    }

    /// Override the header the token is read from.
    pub fn token_header(mut self, header: impl Into<String>) -> Self {
        self.token_header = header.into();
        self
    }

    /// Override the prefix stripped from the token value.
    pub fn token_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.token_prefix = prefix.into();
        self
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            shared: Arc::new(BearerAuthShared {
                authorizer: self.authorizer.clone(),
                classifier: self.classifier.clone(),
                token_header: self.token_header.clone(),
                token_prefix: self.token_prefix.clone(),
            }),
        }
    }
}

/// Bearer-token authorization service wrapper.
#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    shared: Arc<BearerAuthShared>,
}

impl<S> Service<Request<Body>> for BearerAuthService<S>
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
        let shared = self.shared.clone();
        let mut inner = self.inner.clone();

        let level = shared.classifier.classify(req.uri().path());
        if level == AuthLevel::Ignore {
            return Box::pin(async move { inner.call(req).await });
        }

        let token = extract_token(&req, &shared.token_header, &shared.token_prefix);
        let ctx = context_of(&req);
        let path = req.uri().path().to_string();

        Box::pin(async move {
            match shared.authorizer.authorize(&token, ctx.as_ref()).await {
                Ok(()) => inner.call(req).await,
                Err(err) if level == AuthLevel::Optional => {
                    debug!(path = %path, code = %err.code, "optional auth failed, continuing");
                    inner.call(req).await
                }
                Err(err) => Ok(reject(ctx.as_ref(), err)),
            }
        })
    }
}

/// Pull the token out of the configured header, stripping the prefix.
fn extract_token<B>(req: &Request<B>, header: &str, prefix: &str) -> String {
    let raw = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

/// Render the 401 envelope, through the context when one is installed.
fn reject(ctx: Option<&RequestContext>, err: ApiError) -> Response<Body> {
    match ctx {
        Some(ctx) => ctx.fail_with_status(err, Some(StatusCode::UNAUTHORIZED)),
        None => Envelope::from_error(&err, err.message.clone())
            .with_status(StatusCode::UNAUTHORIZED)
            .into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    fn ok_service()
    -> impl Service<Request<Body>, Response = Response<Body>, Error = std::convert::Infallible, Future: Send> + Clone + Send + 'static
    {
        tower::service_fn(|_req: Request<Body>| async move {
            Ok::<_, std::convert::Infallible>(Response::new(Body::from("handled")))
        })
    }

    fn auth_layer() -> BearerAuthLayer {
        BearerAuthLayer::with_classifier(
            Arc::new(StaticTokenAuthorizer::new("open-sesame")),
            PathClassifier::new(AuthLevel::Verify)
                .exact("/health/check", AuthLevel::Ignore)
                .exact("/feed", AuthLevel::Optional),
        )
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let svc = auth_layer().layer(ok_service());

        let response = svc
            .oneshot(
                Request::builder()
                    .uri("/orders")
                    .header("authorization", "Bearer open-sesame")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let svc = auth_layer().layer(ok_service());

        let response = svc
            .oneshot(
                Request::builder()
                    .uri("/orders")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], CODE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let svc = auth_layer().layer(ok_service());

        let response = svc
            .oneshot(Request::builder().uri("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ignored_path_skips_authorizer() {
        struct PanicAuthorizer;

        #[async_trait]
        impl Authorizer for PanicAuthorizer {
            async fn authorize(
                &self,
                _token: &str,
                _ctx: Option<&RequestContext>,
            ) -> Result<(), ApiError> {
                panic!("authorizer must not run for ignored paths");
            }
        }

        let layer = BearerAuthLayer::with_classifier(
            Arc::new(PanicAuthorizer),
            PathClassifier::new(AuthLevel::Verify).exact("/health/check", AuthLevel::Ignore),
        );
        let svc = layer.layer(ok_service());

        let response = svc
            .oneshot(
                Request::builder()
                    .uri("/health/check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_optional_path_continues_on_failure() {
        let svc = auth_layer().layer(ok_service());

        let response = svc
            .oneshot(
                Request::builder()
                    .uri("/feed")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"handled");
    }

    #[tokio::test]
    async fn test_custom_header_and_prefix() {
        let layer = BearerAuthLayer::new(Arc::new(StaticTokenAuthorizer::new("tok")))
            .token_header("x-service-token")
            .token_prefix("Token ");
        let svc = layer.layer(ok_service());

        let response = svc
            .oneshot(
                Request::builder()
                    .uri("/orders")
                    .header("x-service-token", "Token tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
