//! Middleware stack composition.
//!
//! [`MiddlewareStack`] wires the individual layers onto an axum `Router`
//! in the documented order (see [`crate::middleware`]), driven by
//! [`Config`] plus the pluggable pieces only the host can supply: the
//! [`Authorizer`] and the [`Signer`]. Components without a supplied
//! implementation are simply not installed.

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::classify::PathClassifier;
use crate::config::Config;
use crate::context::{ContextConfig, ContextLayer, ContextPool};
use crate::health::DEFAULT_HEALTH_PATH;
use crate::middleware::{
    AuthLevel, Authorizer, BearerAuthLayer, ErrorPageLayer, LogLevel, RateLimitError,
    RateLimitLayer, RecoverLayer, RequestLoggerLayer, SignLevel, SignatureLayer, Signer,
    TimestampRule, TraceContextLayer,
};

/// Builder wiring the full middleware stack from configuration.
///
/// # Example
///
/// ```rust,ignore
/// let app = MiddlewareStack::new(Config::from_env()?)
///     .authorizer(Arc::new(MyJwtAuthorizer::new(keys)))
///     .auth_paths(
///         PathClassifier::new(AuthLevel::Verify)
///             .exact("/health/check", AuthLevel::Ignore)
///             .pattern(Regex::new("^/public/")?, AuthLevel::Ignore),
///     )
///     .apply(router)?;
/// ```
pub struct MiddlewareStack {
    config: Config,
    authorizer: Option<Arc<dyn Authorizer>>,
    auth_classifier: Option<PathClassifier<AuthLevel>>,
    signer: Option<Arc<dyn Signer>>,
    sign_classifier: Option<PathClassifier<SignLevel>>,
    sign_timestamp: bool,
    log_classifier: Option<PathClassifier<LogLevel>>,
    pool: Option<Arc<ContextPool>>,
}

impl MiddlewareStack {
    /// Start a stack from configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            authorizer: None,
            auth_classifier: None,
            signer: None,
            sign_classifier: None,
            sign_timestamp: false,
            log_classifier: None,
            pool: None,
        }
    }

    /// Install bearer-token authorization with this verifier.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Override the auth path classifier (default: verify everything except
    /// the health check).
    pub fn auth_paths(mut self, classifier: PathClassifier<AuthLevel>) -> Self {
        self.auth_classifier = Some(classifier);
        self
    }

    /// Install request-signature verification with this signer.
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Override the signature path classifier (default: verify everything
    /// except the health check).
    pub fn sign_paths(mut self, classifier: PathClassifier<SignLevel>) -> Self {
        self.sign_classifier = Some(classifier);
        self
    }

    /// Also enforce timestamp freshness on signed requests, using the
    /// configured `SIGNATURE_MAX_AGE_SECS` window.
    pub fn sign_timestamp(mut self) -> Self {
        self.sign_timestamp = true;
        self
    }

    /// Override the logger path classifier (default: log everything except
    /// the health check, response bodies per configuration).
    pub fn log_paths(mut self, classifier: PathClassifier<LogLevel>) -> Self {
        self.log_classifier = Some(classifier);
        self
    }

    /// Share an existing context pool (several routers, one pool).
    pub fn context_pool(mut self, pool: Arc<ContextPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Apply the stack to a router.
    ///
    /// Layers are applied innermost-first; the resulting order for a
    /// request is context → trace → logger → error page → recover → rate
    /// limit → signature → auth → handler.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] when rate limiting is enabled with an
    /// invalid quota.
    pub fn apply(self, mut router: Router) -> Result<Router, RateLimitError> {
        let config = self.config;

        // Innermost: bearer auth (if an authorizer was supplied)
        if let Some(authorizer) = self.authorizer {
            info!(header = %config.auth_token_header, "bearer authorization enabled");
            let classifier = self.auth_classifier.unwrap_or_else(|| {
                PathClassifier::new(AuthLevel::Verify).exact(DEFAULT_HEALTH_PATH, AuthLevel::Ignore)
            });
            router = router.layer(
                BearerAuthLayer::with_classifier(authorizer, classifier)
                    .token_header(config.auth_token_header.clone())
                    .token_prefix(config.auth_token_prefix.clone()),
            );
        } else {
            info!("bearer authorization disabled (no authorizer supplied)");
        }

        // Signature verification (if a signer was supplied)
        if let Some(signer) = self.signer {
            info!(
                max_age_secs = config.signature_max_age.as_secs(),
                "request signing enabled"
            );
            let classifier = self.sign_classifier.unwrap_or_else(|| {
                PathClassifier::new(SignLevel::Verify).exact(DEFAULT_HEALTH_PATH, SignLevel::Ignore)
            });
            let mut layer = SignatureLayer::with_classifier(signer, classifier);
            if self.sign_timestamp {
                layer = layer.timestamp(TimestampRule::seconds(config.signature_max_age));
            }
            router = router.layer(layer);
        }

        // Rate limiting (if enabled)
        if config.rate_limiting_enabled() {
            info!(
                rps = config.rate_limit_rps,
                burst = config.rate_limit_burst,
                "rate limiting enabled"
            );
            router = router.layer(RateLimitLayer::new(
                config.rate_limit_rps,
                config.rate_limit_burst,
            )?);
        } else {
            info!("rate limiting disabled (RATE_LIMIT_RPS=0)");
        }

        // Panic capture: outside the traffic-control layers (host-supplied
        // Authorizer/Signer code runs there) but inside the logger, so a
        // panicking request still produces a request record.
        router = router.layer(RecoverLayer::new(config.env));

        // Bare error statuses become envelopes
        router = router.layer(ErrorPageLayer::new());

        // HTTP-level trace spans
        router = router.layer(TraceLayer::new_for_http());

        // Structured request log
        let log_classifier = self.log_classifier.unwrap_or_else(|| {
            let default_level = if config.log_response_body {
                LogLevel::Full
            } else {
                LogLevel::Partial
            };
            PathClassifier::new(default_level).exact(DEFAULT_HEALTH_PATH, LogLevel::Ignore)
        });
        router = router.layer(
            RequestLoggerLayer::with_classifier(log_classifier)
                .body(config.log_request_body)
                .body_limit(config.log_body_limit),
        );

        // Request/trace id propagation
        router = router.layer(TraceContextLayer::new());

        // Outermost: pooled request context
        let context_layer = match self.pool {
            Some(pool) => ContextLayer::with_pool(pool),
            None => ContextLayer::new(ContextConfig::from(&config)),
        };
        router = router.layer(context_layer);

        Ok(router)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::StaticTokenAuthorizer;

    #[test]
    fn test_stack_applies_with_all_components() {
        let stack = MiddlewareStack::new(Config::default())
            .authorizer(Arc::new(StaticTokenAuthorizer::new("t")))
            .signer(Arc::new(crate::middleware::HmacSigner::new("s")));

        let router = stack.apply(Router::new());
        assert!(router.is_ok());
    }

    #[test]
    fn test_stack_rejects_bad_rate_quota() {
        // rate_limiting_enabled() is false at 0 RPS, so this must succeed.
        let config = Config {
            rate_limit_rps: 0,
            ..Config::default()
        };
        assert!(MiddlewareStack::new(config).apply(Router::new()).is_ok());
    }
}
