//! # Gatekit
//!
//! Composable HTTP middleware for axum services:
//!
//! - **Bearer authorization** behind a pluggable [`Authorizer`] trait
//! - **Structured request logging** with path-classified capture levels
//! - **Per-IP rate limiting** (governor GCRA) with envelope rejections
//! - **Request signing** behind a pluggable [`Signer`] trait
//! - **Panic recovery** rendered as uniform 500 envelopes
//! - **Trace-context propagation** (`X-Request-Id`, per-request spans)
//! - **Generic error rendering** for bare 4xx/5xx responses
//! - a **pooled per-request context** every component shares
//!
//! The heavy lifting — token validation, the limiter algorithm, signature
//! schemes, log sinks, span exporters, session storage — stays outside
//! this crate behind narrow interfaces. What lives here is the glue: header
//! inspection, a shared per-request value bag, and the memoized
//! [path classifier](classify::PathClassifier) that auth, logging, and
//! signing all use to decide how much work each path deserves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Context → Trace → Logger → Error Page → Recover            │
//! │          → Rate Limit → Signature → Bearer Auth             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (RequestContext extractor, Envelope responses)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  External collaborators (Authorizer, Signer, log sink, …)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use axum::Router;
//! use gatekit::middleware::StaticTokenAuthorizer;
//! use gatekit::{Config, MiddlewareStack, health};
//!
//! fn build() -> anyhow::Result<Router> {
//!     let config = Config::from_env()?;
//!     let router = Router::new().merge(health::routes());
//!
//!     let app = MiddlewareStack::new(config)
//!         .authorizer(Arc::new(StaticTokenAuthorizer::new("service-secret")))
//!         .apply(router)?;
//!
//!     Ok(app)
//! }
//! ```
//!
//! Individual layers compose directly with `Router::layer` for hosts that
//! want a different order or subset.

pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod middleware;
pub mod response;
pub mod session;
pub mod stack;

// Re-exports for convenience
pub use classify::{PathClassifier, PathRule};
pub use config::{Config, Env};
pub use context::{ContextConfig, ContextLayer, ContextPool, RequestContext};
pub use error::{ApiError, ApiResult, translate};
pub use middleware::{Authorizer, Signer};
pub use response::Envelope;
pub use session::Session;
pub use stack::MiddlewareStack;
