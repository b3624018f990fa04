//! Liveness check route.
//!
//! Mountable router answering `POST /health/check` with a plain-text
//! timestamp. Typically classified `Ignore` for auth, signing, and logging
//! so probes stay cheap and quiet.

use axum::Router;
use axum::routing::post;
use chrono::Utc;

/// Default health check path.
pub const DEFAULT_HEALTH_PATH: &str = "/health/check";

/// Router with the health check mounted at [`DEFAULT_HEALTH_PATH`].
pub fn routes() -> Router {
    routes_at(DEFAULT_HEALTH_PATH)
}

/// Router with the health check mounted at a custom path.
pub fn routes_at(path: &str) -> Router {
    Router::new().route(path, post(check))
}

/// Health check handler.
async fn check() -> String {
    format!("check at:{}", Utc::now().to_rfc3339())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check_responds_with_timestamp() {
        let app = routes();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(DEFAULT_HEALTH_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("check at:"));
    }

    #[tokio::test]
    async fn test_custom_path() {
        let app = routes_at("/internal/ping");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/internal/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
