//! HTTP middleware components.
//!
//! Each middleware is a Tower `Layer`/`Service` pair composing the request
//! context, the path classifier, the error translator, and the response
//! envelope:
//!
//! - **Bearer auth**: token extraction + pluggable [`Authorizer`]
//! - **Request logger**: path-classified structured access records
//! - **Rate limit**: per-IP GCRA limiting with envelope rejections
//! - **Signature**: signed-request verification + pluggable [`Signer`]
//! - **Recover**: panic capture rendered as a 500 envelope
//! - **Trace**: request/trace id propagation and per-request spans
//! - **Error page**: bare error statuses rendered as envelopes
//!
//! # Stack Order
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Context         │ ← pooled value bag into extensions
//! ├──────────────────┤
//! │  Trace           │ ← X-Request-Id, span
//! ├──────────────────┤
//! │  Request Logger  │ ← one record on the way out
//! ├──────────────────┤
//! │  Error Page      │ ← bare 4xx/5xx → envelope
//! ├──────────────────┤
//! │  Recover         │ ← panics → 500 envelope
//! ├──────────────────┤
//! │  Rate Limit      │ ← 429 if exceeded
//! ├──────────────────┤
//! │  Signature       │ ← 401/400 if invalid
//! ├──────────────────┤
//! │  Bearer Auth     │ ← 401 if invalid
//! └──────────────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! [`crate::stack::MiddlewareStack`] applies this order from configuration.

pub mod bearer_auth;
pub mod error_page;
pub mod ip;
pub mod rate_limit;
pub mod recover;
pub mod request_logger;
pub mod signature;
pub mod trace;

pub use bearer_auth::{AuthLevel, Authorizer, BearerAuthLayer, StaticTokenAuthorizer};
pub use error_page::ErrorPageLayer;
pub use ip::{UNKNOWN_IP, client_ip};
pub use rate_limit::{RateLimitError, RateLimitLayer};
pub use recover::RecoverLayer;
pub use request_logger::{LogLevel, RequestLoggerLayer};
pub use signature::{
    HmacSigner, ParamSource, SignLevel, SignatureLayer, Signer, TimestampRule, TimestampUnit,
};
pub use trace::{REQUEST_ID_HEADER, TraceContextLayer};
