//! Per-IP rate limiting middleware.
//!
//! The limiting algorithm itself is external: the `governor` crate's keyed
//! GCRA limiter ("leaky bucket as a meter"). This middleware extracts the
//! client key, consults the limiter, and renders the rejection.
//!
//! # Rejections
//!
//! Rejected requests get a 429 with `Retry-After`, `X-RateLimit-Limit`, and
//! `X-RateLimit-Remaining` headers. Requests carrying a `Referer` header
//! (browser XHR, page navigation) receive the JSON envelope; requests
//! without one receive a plain-text page, so a throttled browser user sees
//! something readable rather than raw JSON.
//!
//! # IP Spoofing
//!
//! Keys come from client-controlled headers; deploy behind a reverse proxy
//! that overwrites `X-Real-IP`/`X-Forwarded-For` or per-IP limiting is
//! advisory at best.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::warn;

use super::ip::client_ip;
use crate::context::{RequestContext, context_of};
use crate::error::ApiError;
use crate::response::Envelope;

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// RPS value cannot be zero.
    ZeroRps,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroRps => {
                write!(f, "RPS must be greater than 0; omit the layer for no limiting")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Type alias for the per-IP keyed limiter.
type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-IP rate limiting layer for the Tower middleware stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<KeyedLimiter>,
    /// Configured RPS limit (for response headers)
    limit: u32,
}

impl RateLimitLayer {
    /// Create a per-IP rate limit layer.
    ///
    /// # Arguments
    ///
    /// * `rps` - Sustained requests per second per IP
    /// * `burst` - Additional burst capacity per IP (minimum 1)
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::ZeroRps`] if `rps` is 0; omit the layer to
    /// disable limiting.
    pub fn new(rps: u32, burst: u32) -> Result<Self, RateLimitError> {
        let rps_nonzero = NonZeroU32::new(rps).ok_or(RateLimitError::ZeroRps)?;

        const MIN_BURST: NonZeroU32 = NonZeroU32::new(1).unwrap();
        let burst_nonzero = NonZeroU32::new(burst).unwrap_or(MIN_BURST);

        let quota = Quota::per_second(rps_nonzero).allow_burst(burst_nonzero);

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            limit: rps,
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            limit: self.limit,
        }
    }
}

/// Per-IP rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<KeyedLimiter>,
    limit: u32,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let limiter = self.limiter.clone();
        let limit = self.limit;
        let mut inner = self.inner.clone();

        let key = client_ip(&req).into_owned();

        Box::pin(async move {
            match limiter.check_key(&key) {
                Ok(_) => inner.call(req).await,
                Err(not_until) => {
                    let wait_time =
                        not_until.wait_time_from(DefaultClock::default().now());
                    let retry_after = wait_time.as_secs().max(1);
                    let from_browser = req.headers().get(header::REFERER).is_none();

                    warn!(
                        client_ip = %key,
                        path = %req.uri().path(),
                        retry_after_secs = retry_after,
                        "rate limit exceeded"
                    );

                    let ctx = context_of(&req);
                    Ok(reject(ctx.as_ref(), limit, retry_after, from_browser))
                }
            }
        })
    }
}

/// Build the 429 response with limiter headers.
fn reject(
    ctx: Option<&RequestContext>,
    limit: u32,
    retry_after: u64,
    as_text: bool,
) -> Response<Body> {
    let err = ApiError::rate_limited(retry_after);

    let mut response = if as_text {
        let mut envelope = Envelope::text(err.code.clone(), err.message.clone())
            .with_status(StatusCode::TOO_MANY_REQUESTS);
        if let Some(ctx) = ctx {
            ctx.record_error(&err);
            if let Some(rid) = ctx.request_id() {
                envelope = envelope.with_rid(rid);
            }
        }
        envelope.into_response()
    } else {
        match ctx {
            Some(ctx) => ctx.fail_with_status(err, Some(StatusCode::TOO_MANY_REQUESTS)),
            None => Envelope::from_error(&err, err.message.clone())
                .with_status(StatusCode::TOO_MANY_REQUESTS)
                .into_response(),
        }
    };

    let headers = response.headers_mut();
    if let Ok(value) = retry_after.to_string().parse() {
        headers.insert(header::RETRY_AFTER, value);
    }
    if let Ok(value) = limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = "0".parse() {
        headers.insert("x-ratelimit-remaining", value);
    }

    response
}
