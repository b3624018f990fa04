//! Request-signature verification middleware.
//!
//! Extracts a flat parameter map from the request (JSON body, form body,
//! or query string), optionally enforces a timestamp freshness window, and
//! hands the map to a [`Signer`] for verification. The signature scheme
//! itself is external; a reference [`HmacSigner`] (HMAC-SHA256 over the
//! sorted parameters) ships for the common shared-secret case.
//!
//! The consumed body is restored before the request continues, so handlers
//! still read it normally.
//!
//! # Path Levels
//!
//! Paths classify to [`SignLevel::Ignore`] or [`SignLevel::Verify`]
//! (default `Verify`), memoized per path.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

use crate::classify::PathClassifier;
use crate::context::{RequestContext, context_of};
use crate::error::ApiError;
use crate::response::Envelope;

type HmacSha256 = Hmac<Sha256>;

/// Error code for a missing timestamp parameter.
pub const CODE_NO_TIMESTAMP: &str = "3001";
/// Error code for a timestamp ahead of the server clock.
pub const CODE_TIMESTAMP_FUTURE: &str = "3002";
/// Error code for an expired timestamp.
pub const CODE_TIMESTAMP_EXPIRED: &str = "3003";
/// Error code for a failed signature check.
pub const CODE_BAD_SIGNATURE: &str = "3004";

/// Allowed clock skew for timestamps ahead of the server.
const FUTURE_SKEW: Duration = Duration::from_secs(10);

/// Cap on buffered request bodies during verification.
const MAX_SIGNED_BODY: usize = 1024 * 1024;

/// Whether a path's requests must be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignLevel {
    /// Skip verification.
    Ignore,
    /// Verify the signature, rejecting on failure.
    Verify,
}

/// Where the signed parameters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamSource {
    /// JSON object request body.
    #[default]
    Json,
    /// URL-encoded form body.
    Form,
    /// Query string.
    Query,
}

/// Timestamp freshness rule.
#[derive(Debug, Clone)]
pub struct TimestampRule {
    /// Parameter carrying the timestamp (default: "timestamp").
    pub property: String,
    /// Maximum accepted age.
    pub max_age: Duration,
    /// Unit the client sends the timestamp in.
    pub unit: TimestampUnit,
}

/// Unit of the timestamp parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl TimestampRule {
    /// Freshness rule on the `timestamp` parameter, in seconds.
    pub fn seconds(max_age: Duration) -> Self {
        Self {
            property: "timestamp".to_string(),
            max_age,
            unit: TimestampUnit::Seconds,
        }
    }

    /// Override the parameter name.
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = property.into();
        self
    }

    /// Use millisecond timestamps.
    pub fn milliseconds(mut self) -> Self {
        self.unit = TimestampUnit::Milliseconds;
        self
    }
}

/// Pluggable signature verifier.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Verify the extracted parameter map.
    async fn verify(&self, params: &Map<String, Value>) -> Result<(), ApiError>;
}

/// Reference HMAC-SHA256 signer.
///
/// The signature is the hex HMAC of the parameters sorted by key and joined
/// as `k=v&k=v`, excluding the signature parameter itself. Comparison is
/// constant-time.
pub struct HmacSigner {
    secret: String,
    /// Parameter carrying the signature (default: "sign").
    property: String,
}

impl HmacSigner {
    /// Create a signer with the shared secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            property: "sign".to_string(),
        }
    }

    /// Override the signature parameter name.
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = property.into();
        self
    }

    /// Compute the expected signature for a parameter map.
    ///
    /// Exposed so clients (and tests) can sign outbound requests the same
    /// way the middleware verifies them.
    pub fn sign(&self, params: &Map<String, Value>) -> Result<String, ApiError> {
        let mut keys: Vec<&String> = params
            .keys()
            .filter(|k| *k != &self.property)
            .collect();
        keys.sort();

        let canonical = keys
            .iter()
            .map(|k| format!("{}={}", k, canonical_value(params.get(*k))))
            .collect::<Vec<_>>()
            .join("&");

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ApiError::internal(format!("invalid signing secret: {e}")))?;
        mac.update(canonical.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Render a parameter value the way clients serialize it for signing.
fn canonical_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl Signer for HmacSigner {
    async fn verify(&self, params: &Map<String, Value>) -> Result<(), ApiError> {
        let provided = match params.get(&self.property) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(ApiError::new(
                    CODE_BAD_SIGNATURE,
                    format!("{} required", self.property),
                ));
            }
        };

        let expected = self.sign(params)?;
        let matches: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();
        if matches {
            Ok(())
        } else {
            Err(ApiError::new(CODE_BAD_SIGNATURE, "invalid signature"))
        }
    }
}

/// Shared middleware state, frozen when the layer wraps a service.
struct SignatureShared {
    signer: Arc<dyn Signer>,
    classifier: Arc<PathClassifier<SignLevel>>,
    source: ParamSource,
    timestamp: Option<TimestampRule>,
}

/// Request-signature layer for the Tower middleware stack.
#[derive(Clone)]
pub struct SignatureLayer {
    signer: Arc<dyn Signer>,
    classifier: Arc<PathClassifier<SignLevel>>,
    source: ParamSource,
    timestamp: Option<TimestampRule>,
}

impl SignatureLayer {
    /// Create a layer verifying every path (`Verify` default).
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self::with_classifier(signer, PathClassifier::new(SignLevel::Verify))
    }

    /// Create a layer with a custom path classifier.
    pub fn with_classifier(
        signer: Arc<dyn Signer>,
        classifier: PathClassifier<SignLevel>,
    ) -> Self {
        Self {
            signer,
            classifier: Arc::new(classifier),
            source: ParamSource::default(),
            timestamp: None,
        }
    }

    /// Where the signed parameters live (default: JSON body).
    pub fn source(mut self, source: ParamSource) -> Self {
        self.source = source;
        self
    }

    /// Enforce a timestamp freshness window.
    pub fn timestamp(mut self, rule: TimestampRule) -> Self {
        self.timestamp = Some(rule);
        self
    }
}

impl<S> Layer<S> for SignatureLayer {
    type Service = SignatureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SignatureService {
            inner,
            shared: Arc::new(SignatureShared {
                signer: self.signer.clone(),
                classifier: self.classifier.clone(),
                source: self.source,
                timestamp: self.timestamp.clone(),
            }),
        }
    }
}

/// Request-signature service wrapper.
#[derive(Clone)]
pub struct SignatureService<S> {
    inner: S,
    shared: Arc<SignatureShared>,
}

impl<S> Service<Request<Body>> for SignatureService<S>
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
        if level == SignLevel::Ignore {
            return Box::pin(async move { inner.call(req).await });
        }

        let ctx = context_of(&req);

        Box::pin(async move {
            let (req, params) = match extract_params(req, shared.source).await {
                Ok(extracted) => extracted,
                Err(err) => return Ok(reject(ctx.as_ref(), err, StatusCode::BAD_REQUEST)),
            };

            if let Some(ref rule) = shared.timestamp
                && let Err(err) = check_timestamp(&params, rule)
            {
                return Ok(reject(ctx.as_ref(), err, StatusCode::BAD_REQUEST));
            }

            match shared.signer.verify(&params).await {
                Ok(()) => inner.call(req).await,
                Err(err) => Ok(reject(ctx.as_ref(), err, StatusCode::UNAUTHORIZED)),
            }
        })
    }
}

/// Pull the parameter map out of the request, restoring the body.
async fn extract_params(
    req: Request<Body>,
    source: ParamSource,
) -> Result<(Request<Body>, Map<String, Value>), ApiError> {
    match source {
        ParamSource::Query => {
            let params = parse_form(req.uri().query().unwrap_or("").as_bytes());
            Ok((req, params))
        }
        ParamSource::Form | ParamSource::Json => {
            let (parts, body) = req.into_parts();
            let bytes = to_bytes(body, MAX_SIGNED_BODY)
                .await
                .map_err(|e| ApiError::read_params(e))?;

            let params = match source {
                ParamSource::Form => parse_form(&bytes),
                _ => {
                    if bytes.is_empty() {
                        Map::new()
                    } else {
                        serde_json::from_slice::<Map<String, Value>>(&bytes)
                            .map_err(|e| ApiError::read_params(e))?
                    }
                }
            };

            let req = Request::from_parts(parts, Body::from(bytes));
            Ok((req, params))
        }
    }
}

/// Decode URL-encoded pairs into a flat string map.
fn parse_form(bytes: &[u8]) -> Map<String, Value> {
    url::form_urlencoded::parse(bytes)
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}

/// Enforce the timestamp freshness window.
fn check_timestamp(params: &Map<String, Value>, rule: &TimestampRule) -> Result<(), ApiError> {
    let raw = params.get(&rule.property);

    let ticks = match raw {
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    };

    let Some(ticks) = ticks else {
        return Err(ApiError::new(CODE_NO_TIMESTAMP, rule.property.clone()));
    };

    let stamp_secs = match rule.unit {
        TimestampUnit::Seconds => ticks,
        TimestampUnit::Milliseconds => ticks / 1000,
    };

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ApiError::internal(format!("system clock error: {e}")))?
        .as_secs() as i64;

    if stamp_secs - now_secs > FUTURE_SKEW.as_secs() as i64 {
        return Err(ApiError::new(
            CODE_TIMESTAMP_FUTURE,
            format!("{} time can't be after now", rule.property),
        ));
    }

    if now_secs - stamp_secs > rule.max_age.as_secs() as i64 {
        return Err(ApiError::new(
            CODE_TIMESTAMP_EXPIRED,
            format!(
                "{} expired (validity {}s)",
                rule.property,
                rule.max_age.as_secs()
            ),
        ));
    }

    Ok(())
}

/// Render the rejection envelope, through the context when installed.
fn reject(ctx: Option<&RequestContext>, err: ApiError, status: StatusCode) -> Response<Body> {
    match ctx {
        Some(ctx) => ctx.fail_with_status(err, Some(status)),
        None => Envelope::from_error(&err, err.message.clone())
            .with_status(status)
            .into_response(),
    }
}
