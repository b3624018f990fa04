//! Middleware configuration loaded from environment variables.
//!
//! All knobs have development-friendly defaults; production deployments
//! configure via environment variables or a `.env` file.
//!
//! # Error Masking
//!
//! - `APP_ENV`: `production` enables masking of system error messages
//! - `APP_INTERNAL`: `true` disables masking even in production (the
//!   service is only reachable by other services)
//! - `SYSTEM_ERROR_CODE`: overrides the default `100` code for translated
//!   system errors
//!
//! # Security and Traffic
//!
//! - `AUTH_TOKEN_HEADER` / `AUTH_TOKEN_PREFIX`: where bearer tokens live
//! - `RATE_LIMIT_RPS` / `RATE_LIMIT_BURST`: per-IP limiter settings (0 RPS
//!   disables limiting)
//! - `SIGNATURE_MAX_AGE_SECS`: freshness window for signed requests

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ApiError, ApiResult};

/// Deployment environment, controls error-message masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Env {
    #[default]
    Development,
    Production,
}

impl FromStr for Env {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Env::Production),
            "development" | "dev" | "" => Ok(Env::Development),
            other => Err(ApiError::internal(format!("unknown APP_ENV: {other}"))),
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Env::Development => write!(f, "development"),
            Env::Production => write!(f, "production"),
        }
    }
}

/// Middleware stack configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Application Identity
    // =========================================================================
    /// Deployment environment (default: development)
    pub env: Env,

    /// Application name, attached to log records (default: "app")
    pub application: String,

    /// Whether this service is internal-facing. Internal services render
    /// unmasked system error messages even in production.
    pub internal: bool,

    /// Override code for translated system errors (default: none, uses "100")
    pub system_error_code: Option<String>,

    // =========================================================================
    // Bearer Authorization
    // =========================================================================
    /// Header carrying the bearer token (default: "authorization")
    pub auth_token_header: String,

    /// Prefix stripped from the token value (default: "Bearer ")
    pub auth_token_prefix: String,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Requests per second limit per client IP (default: 100, 0 = disabled)
    pub rate_limit_rps: u32,

    /// Burst capacity above the sustained rate (default: 50)
    pub rate_limit_burst: u32,

    // =========================================================================
    // Request Signing
    // =========================================================================
    /// Freshness window for signed-request timestamps (default: 300s)
    pub signature_max_age: Duration,

    // =========================================================================
    // Request Logging
    // =========================================================================
    /// Log request bodies (default: true)
    pub log_request_body: bool,

    /// Log response bodies for all paths by default (default: false)
    pub log_response_body: bool,

    /// Cap on captured body bytes per request (default: 64 KiB)
    pub log_body_limit: usize,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns a system [`ApiError`] if a variable is present but invalid
    /// (e.g. non-numeric `RATE_LIMIT_RPS`).
    pub fn from_env() -> ApiResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            env: env::var("APP_ENV").unwrap_or_default().parse()?,
            application: env::var("APP_NAME").unwrap_or_else(|_| "app".to_string()),
            internal: Self::parse_env("APP_INTERNAL", false)?,
            system_error_code: env::var("SYSTEM_ERROR_CODE").ok().filter(|c| !c.is_empty()),

            auth_token_header: env::var("AUTH_TOKEN_HEADER")
                .unwrap_or_else(|_| "authorization".to_string()),
            auth_token_prefix: env::var("AUTH_TOKEN_PREFIX")
                .unwrap_or_else(|_| "Bearer ".to_string()),

            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 100)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 50)?,

            signature_max_age: Duration::from_secs(Self::parse_env(
                "SIGNATURE_MAX_AGE_SECS",
                300,
            )?),

            log_request_body: Self::parse_env("LOG_REQUEST_BODY", true)?,
            log_response_body: Self::parse_env("LOG_RESPONSE_BODY", false)?,
            log_body_limit: Self::parse_env("LOG_BODY_LIMIT", 64 * 1024)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    fn validate(&self) -> ApiResult<()> {
        if self.log_body_limit == 0 {
            return Err(ApiError::internal(
                "LOG_BODY_LIMIT must be greater than 0".to_string(),
            ));
        }

        if self.signature_max_age.is_zero() {
            return Err(ApiError::internal(
                "SIGNATURE_MAX_AGE_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> ApiResult<T>
    where
        T: FromStr + ToString,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| ApiError::internal(format!("invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Default configuration for testing and development.
impl Default for Config {
    fn default() -> Self {
        Self {
            env: Env::Development,
            application: "app".to_string(),
            internal: false,
            system_error_code: None,
            auth_token_header: "authorization".to_string(),
            auth_token_prefix: "Bearer ".to_string(),
            rate_limit_rps: 100,
            rate_limit_burst: 50,
            signature_max_age: Duration::from_secs(300),
            log_request_body: true,
            log_response_body: false,
            log_body_limit: 64 * 1024,
        }
    }
}
