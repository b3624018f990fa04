use std::fmt;

use thiserror::Error;

use crate::config::Env;

/// Uniform application error: a (code, message, system) triple.
///
/// Business errors (`system == false`) carry messages that are safe to show
/// to callers. System errors (`system == true`) describe internal failures;
/// their messages are masked before rendering in production unless the
/// service is marked internal.
///
/// The optional `chain` records which upstream service produced the error
/// when it crossed a service boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub system: bool,
    pub chain: Option<String>,
}

/// Code for generic system failures.
pub const CODE_SYSTEM: &str = "100";
/// Code for routing/handler failures (including recovered panics).
pub const CODE_HANDLER: &str = "101";
/// Code for unreadable request parameters (malformed JSON, bad form data).
pub const CODE_READ_PARAMS: &str = "1001";
/// Code for parameter validation failures.
pub const CODE_VALIDATION: &str = "1002";
/// Code for rate-limit rejections.
pub const CODE_RATE_LIMITED: &str = "1003";

impl ApiError {
    /// Create a business error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            system: false,
            chain: None,
        }
    }

    /// Create a system error with the given code and message.
    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            system: true,
            chain: None,
        }
    }

    /// Generic internal failure (code `100`).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::system(CODE_SYSTEM, message)
    }

    /// Routing/handler failure (code `101`).
    pub fn handler(detail: impl fmt::Display) -> Self {
        Self::system(CODE_HANDLER, format!("routing failed:{detail}"))
    }

    /// Unreadable request parameters (code `1001`).
    pub fn read_params(detail: impl fmt::Display) -> Self {
        Self::new(CODE_READ_PARAMS, format!("params read failed:{detail}"))
    }

    /// Parameter validation failure (code `1002`).
    pub fn validation(detail: impl fmt::Display) -> Self {
        Self::new(CODE_VALIDATION, format!("params validate failed:{detail}"))
    }

    /// Rate-limit rejection (code `1003`).
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            CODE_RATE_LIMITED,
            format!("too many requests, retry in {retry_after_secs}s"),
        )
    }

    /// Attach the name of the upstream service the error crossed.
    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    /// The message as it may be shown to the caller.
    ///
    /// System error messages are replaced with a fixed string in production
    /// unless the service is internal-facing.
    pub fn public_message(&self, env: Env, internal: bool) -> &str {
        if self.system && env == Env::Production && !internal {
            "system error"
        } else {
            &self.message
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Translate a heterogeneous error into the uniform triple.
///
/// Recognized sources, checked in order:
///
/// 1. [`ApiError`] passes through unchanged.
/// 2. `serde_json::Error` becomes a `1001` business error with a sanitized
///    message (internal type names never reach the caller).
/// 3. `validator::ValidationErrors` becomes a `1002` business error listing
///    the offending fields.
/// 4. Everything else is a system error with code `100`, or the configured
///    override code when one is set.
pub fn translate(err: &anyhow::Error, system_code: Option<&str>) -> ApiError {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return api.clone();
    }

    if let Some(json_err) = err.downcast_ref::<serde_json::Error>() {
        return ApiError::read_params(sanitize_json_error(json_err));
    }

    if let Some(validation) = err.downcast_ref::<validator::ValidationErrors>() {
        return ApiError::validation(validation_summary(validation));
    }

    let code = system_code.unwrap_or(CODE_SYSTEM);
    ApiError::system(code, err.to_string())
}

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
fn sanitize_json_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "malformed JSON in request body".to_string();
    }

    "invalid request format".to_string()
}

/// Summarize validation failures as a comma-separated field list.
fn validation_summary(errors: &validator::ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .keys()
        .map(|k| k.to_string())
        .collect();
    fields.sort();
    fields.join(",")
}

/// Convenience type alias for Results with ApiError.
pub type ApiResult<T> = Result<T, ApiError>;
