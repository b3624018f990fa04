//! Wire-level response envelope.
//!
//! Every response this crate renders — success payloads, rejected requests,
//! recovered panics, fallback error pages — is the same envelope:
//!
//! ```json
//! {"code":"00","message":"","rid":"6f1c...","data":{...}}
//! ```
//!
//! `system`, `chain`, `rid` and `data` are omitted when unset. The success
//! code is `"00"` with an empty message; everything else is an error code
//! from the translator or from application error factories.
//!
//! Besides the default JSON rendering, an envelope can carry a plain-text
//! or binary payload (used by the error page and by handlers returning raw
//! content); the code/message pair is still tracked for logging.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use crate::error::{ApiError, CODE_READ_PARAMS, CODE_VALIDATION};

/// Application-level success code.
pub const SUCCESS_CODE: &str = "00";

/// Marker inserted into responses produced by [`Envelope`].
///
/// The fallback error renderer skips responses carrying this marker so an
/// already-rendered rejection is never rewritten.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeRendered;

/// How the envelope is written to the wire.
#[derive(Debug, Clone)]
enum Payload {
    /// Serialize the envelope itself as JSON.
    Json,
    /// Plain text body; code/message kept for logging only.
    Text(String),
    /// Raw bytes; code/message kept for logging only.
    Binary(Vec<u8>),
}

/// Uniform response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "is_false")]
    pub system: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip)]
    status: StatusCode,
    #[serde(skip)]
    payload: Payload,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

impl Envelope {
    /// Success envelope, optionally carrying a data payload.
    pub fn success(data: Option<Value>) -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            message: String::new(),
            system: false,
            chain: None,
            rid: None,
            data,
            status: StatusCode::OK,
            payload: Payload::Json,
        }
    }

    /// Error envelope with an explicit code and message.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let status = default_status(&code, false);
        Self {
            code,
            message: message.into(),
            system: false,
            chain: None,
            rid: None,
            data: None,
            status,
            payload: Payload::Json,
        }
    }

    /// Error envelope from a translated [`ApiError`], message already masked
    /// by the caller where required.
    pub fn from_error(err: &ApiError, message: impl Into<String>) -> Self {
        Self {
            code: err.code.clone(),
            message: message.into(),
            system: err.system,
            chain: err.chain.clone(),
            rid: None,
            data: None,
            status: default_status(&err.code, err.system),
            payload: Payload::Json,
        }
    }

    /// Plain-text envelope (status text pages, health checks).
    pub fn text(code: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            code: code.into(),
            message: body.clone(),
            system: false,
            chain: None,
            rid: None,
            data: None,
            status: StatusCode::OK,
            payload: Payload::Text(body),
        }
    }

    /// Binary envelope.
    pub fn binary(code: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            code: code.into(),
            message: String::new(),
            system: false,
            chain: None,
            rid: None,
            data: None,
            status: StatusCode::OK,
            payload: Payload::Binary(body),
        }
    }

    /// Attach the request id.
    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Override the HTTP status.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// The HTTP status this envelope renders with.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Default HTTP status for an error code.
///
/// Parameter errors are the caller's fault, system errors are ours,
/// anything else stays 200 with the application-level code carrying the
/// outcome.
fn default_status(code: &str, system: bool) -> StatusCode {
    if system {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if code == CODE_READ_PARAMS || code == CODE_VALIDATION {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status = self.status;
        let mut response = match &self.payload {
            Payload::Json => (status, Json(&self)).into_response(),
            Payload::Text(body) => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body.clone(),
            )
                .into_response(),
            Payload::Binary(body) => (
                status,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                body.clone(),
            )
                .into_response(),
        };
        response.extensions_mut().insert(EnvelopeRendered);
        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_shape() {
        let envelope = Envelope::success(Some(json!({"id": 7})));
        let body = serde_json::to_value(&envelope).unwrap();

        assert_eq!(body["code"], "00");
        assert_eq!(body["message"], "");
        assert_eq!(body["data"]["id"], 7);
        // Unset optional fields are omitted, not null.
        assert!(body.get("system").is_none());
        assert!(body.get("chain").is_none());
        assert!(body.get("rid").is_none());
    }

    #[test]
    fn test_error_envelope_with_rid_and_chain() {
        let err = ApiError::internal("boom").with_chain("billing");
        let envelope = Envelope::from_error(&err, "system error").with_rid("req-1");
        let body = serde_json::to_value(&envelope).unwrap();

        assert_eq!(body["code"], "100");
        assert_eq!(body["message"], "system error");
        assert_eq!(body["system"], true);
        assert_eq!(body["chain"], "billing");
        assert_eq!(body["rid"], "req-1");
    }

    #[test]
    fn test_default_status_mapping() {
        assert_eq!(
            Envelope::from_error(&ApiError::internal("x"), "x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Envelope::from_error(&ApiError::read_params("x"), "x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Envelope::from_error(&ApiError::validation("x"), "x").status(),
            StatusCode::BAD_REQUEST
        );
        // Business errors keep HTTP 200; the envelope code carries the outcome.
        assert_eq!(
            Envelope::from_error(&ApiError::new("2001", "not found"), "not found").status(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_status_override() {
        let envelope = Envelope::error("1003", "slow down").with_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(envelope.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rendered_response_carries_marker() {
        let response = Envelope::success(None).into_response();
        assert!(response.extensions().get::<EnvelopeRendered>().is_some());
    }

    #[tokio::test]
    async fn test_text_payload_content_type() {
        let response = Envelope::text("00", "check at:2026-01-01").into_response();
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }
}
