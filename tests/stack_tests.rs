//! End-to-end tests for the composed middleware stack.
//!
//! Each test builds a real axum `Router`, applies the stack, and drives it
//! in-process with `tower::ServiceExt::oneshot` — no sockets, no external
//! services.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower::ServiceExt;

use gatekit::classify::PathClassifier;
use gatekit::middleware::{AuthLevel, HmacSigner, SignLevel, StaticTokenAuthorizer};
use gatekit::{Config, Env, MiddlewareStack, RequestContext, health};

const TOKEN: &str = "service-secret";

/// A handler that uses the context the way applications do.
async fn create_order(ctx: RequestContext) -> Response {
    ctx.add_log_field("order_kind", json!("standard"));
    ctx.success(Some(json!({"order": "A-17"})))
}

async fn broken(ctx: RequestContext) -> Response {
    ctx.fail_any(&anyhow::anyhow!("downstream exploded"))
}

async fn panicking() -> Response {
    panic!("handler bug");
}

fn test_config() -> Config {
    Config {
        // High limits so unrelated tests never throttle.
        rate_limit_rps: 10_000,
        rate_limit_burst: 1_000,
        ..Config::default()
    }
}

fn app(config: Config) -> Router {
    let router = Router::new()
        .route("/orders", post(create_order))
        .route("/broken", get(broken))
        .route("/panic", get(panicking))
        .merge(health::routes());

    MiddlewareStack::new(config)
        .authorizer(Arc::new(StaticTokenAuthorizer::new(TOKEN)))
        .auth_paths(
            PathClassifier::new(AuthLevel::Verify)
                .exact(health::DEFAULT_HEALTH_PATH, AuthLevel::Ignore)
                .exact("/panic", AuthLevel::Ignore)
                .exact("/broken", AuthLevel::Ignore),
        )
        .apply(router)
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_bypasses_auth() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(health::DEFAULT_HEALTH_PATH)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8(bytes.to_vec())
        .unwrap()
        .starts_with("check at:"));
}

#[tokio::test]
async fn missing_token_is_rejected_with_envelope() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // The stack always stamps a request id on the response.
    assert!(response.headers().get("x-request-id").is_some());

    let body = json_body(response).await;
    assert_eq!(body["code"], "1101");
    assert!(body["rid"].is_string());
}

#[tokio::test]
async fn valid_token_reaches_handler() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["code"], "00");
    assert_eq!(body["data"]["order"], "A-17");
    assert!(body["rid"].is_string());
}

#[tokio::test]
async fn caller_request_id_is_propagated_into_the_envelope() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("authorization", format!("Bearer {TOKEN}"))
                .header("x-request-id", "corr-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "corr-123"
    );
    let body = json_body(response).await;
    assert_eq!(body["rid"], "corr-123");
}

#[tokio::test]
async fn handler_panic_renders_500_envelope() {
    let response = app(test_config())
        .oneshot(Request::builder().uri("/panic").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], "101");
    assert_eq!(body["system"], true);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("handler bug"));
}

#[tokio::test]
async fn system_errors_are_masked_in_production() {
    let config = Config {
        env: Env::Production,
        ..test_config()
    };

    let response = app(config)
        .oneshot(Request::builder().uri("/broken").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], "100");
    assert_eq!(body["message"], "system error");
}

#[tokio::test]
async fn system_errors_keep_detail_for_internal_services() {
    let config = Config {
        env: Env::Production,
        internal: true,
        ..test_config()
    };

    let response = app(config)
        .oneshot(Request::builder().uri("/broken").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let body = json_body(response).await;
    assert_eq!(body["message"], "downstream exploded");
}

#[tokio::test]
async fn unknown_path_renders_error_page_envelope() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .uri("/no-such-route")
                .header("accept", "application/json")
                // Auth rejects unknown paths before routing does, so
                // present a valid token to reach the router fallback.
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "404");
    assert_eq!(body["message"], "Not Found");
}

#[tokio::test]
async fn unknown_path_renders_text_without_accept_header() {
    let response = app(test_config())
        .oneshot(
            Request::builder()
                .uri("/no-such-route")
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"Not Found");
}

#[tokio::test]
async fn rate_limit_rejects_with_envelope_and_headers() {
    let config = Config {
        rate_limit_rps: 1,
        rate_limit_burst: 1,
        ..Config::default()
    };
    let app = app(config);

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("authorization", format!("Bearer {TOKEN}"))
                .header("x-real-ip", "203.0.113.99")
                .header("referer", "https://app.example.com/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("authorization", format!("Bearer {TOKEN}"))
                .header("x-real-ip", "203.0.113.99")
                .header("referer", "https://app.example.com/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().get("retry-after").is_some());

    let body = json_body(second).await;
    assert_eq!(body["code"], "1003");
}

/// In-memory sink for asserting on emitted log records.
#[derive(Clone)]
struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn request_log_record_is_emitted() {
    use tracing::instrument::WithSubscriber;

    let buffer = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let writer = LogBuffer(buffer.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();

    let response = app(test_config())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::from(r#"{"qty":3}"#))
                .unwrap(),
        )
        .with_subscriber(subscriber)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let output = String::from_utf8(buffer.lock().clone()).unwrap();
    assert!(output.contains("gatekit::request"), "no request record in: {output}");
    // Handler-added log field and captured request body made it into the record.
    assert!(output.contains("order_kind"));
    assert!(output.contains("qty"));
}

#[tokio::test]
async fn signed_stack_verifies_and_restores_body() {
    async fn echo(body: String) -> String {
        body
    }

    let signer = Arc::new(HmacSigner::new("signing-secret"));

    let mut params = serde_json::Map::new();
    params.insert("order".to_string(), json!("A-17"));
    let sign = signer.sign(&params).unwrap();
    params.insert("sign".to_string(), Value::String(sign));
    let payload = serde_json::to_string(&Value::Object(params)).unwrap();

    let router = Router::new().route("/pay", post(echo));
    let app = MiddlewareStack::new(Config::default())
        .signer(signer)
        .sign_paths(PathClassifier::new(SignLevel::Verify))
        .apply(router)
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pay")
                .header("content-type", "application/json")
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), payload);

    // Tampered payload fails verification.
    let tampered = payload.replace("A-17", "A-99");
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pay")
                .header("content-type", "application/json")
                .body(Body::from(tampered))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "3004");
}
