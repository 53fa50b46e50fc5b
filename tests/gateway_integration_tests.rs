//! # Gateway Integration Tests
//!
//! Drives the full router (request context, endpoints, admin surface and the
//! dispatch pipeline) against wiremock backends through the real HTTP
//! upstream client.

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use chrono::Utc;
use async_trait::async_trait;
use dispatch_gateway::auth::keys::{KeySource, KeySourceError};
use dispatch_gateway::observability::health::ProbeError;
use dispatch_gateway::observability::metrics;
use dispatch_gateway::{build_router, AppState, Collaborators, GatewayConfig};
use jsonwebtoken::{DecodingKey, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header as header_is, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "integration-secret";

fn config_yaml(backend: &str, per_user: u64, body_limit: usize) -> String {
    format!(
        r#"
server:
  max_request_body_size: {body_limit}
auth:
  secret: "{SECRET}"
rate_limiting:
  window: "60s"
  per_user: {per_user}
services:
  auth-service:
    url: "{backend}"
    path_prefix: "/api/v1/auth"
  loan-service:
    url: "{backend}"
    path_prefix: "/api/v1/loans"
    max_retries: 0
    circuit_breaker_threshold: 2
  document-service:
    url: "{backend}"
    path_prefix: "/api/v1/documents"
    critical: false
health:
  enabled: false
"#
    )
}

fn state_for(backend: &MockServer, per_user: u64, body_limit: usize) -> AppState {
    let config =
        GatewayConfig::from_yaml_str(&config_yaml(&backend.uri(), per_user, body_limit)).unwrap();
    AppState::from_config(config, None).unwrap()
}

fn server_for(state: AppState) -> TestServer {
    TestServer::new(build_router(state)).unwrap()
}

fn bearer(user_id: &str, roles: &[&str]) -> HeaderValue {
    let now = Utc::now().timestamp();
    let claims = json!({
        "user_id": user_id,
        "tenant_id": "tenant-7",
        "roles": roles,
        "iat": now,
        "exp": now + 600,
    });
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    HeaderValue::from_str(&format!("Bearer {}", token)).unwrap()
}

#[tokio::test]
async fn test_authenticated_request_is_forwarded_with_identity() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/loans/42"))
        .and(query_param("expand", "schedule"))
        .and(header_is("x-user-id", "user-1"))
        .and(header_is("x-tenant-id", "tenant-7"))
        .and(header_is("x-correlation-id", "corr-abc"))
        .and(header_exists("x-user-roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 42 })))
        .expect(1)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 100, 1024));
    let response = server
        .get("/api/v1/loans/42?expand=schedule")
        .add_header(header::AUTHORIZATION, bearer("user-1", &["borrower"]))
        .add_header(
            HeaderName::from_static("x-correlation-id"),
            HeaderValue::from_static("corr-abc"),
        )
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["id"], 42);

    let headers = response.headers();
    assert_eq!(headers.get("x-correlation-id").unwrap(), "corr-abc");
    assert_eq!(headers.get("x-rate-limit-remaining").unwrap(), "99");
    assert!(headers.get("x-rate-limit-reset").is_some());
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
}

#[tokio::test]
async fn test_spoofed_identity_headers_are_replaced() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/documents"))
        .and(header_is("x-user-id", "user-2"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 100, 1024));
    let response = server
        .post("/api/v1/documents")
        .add_header(header::AUTHORIZATION, bearer("user-2", &["borrower"]))
        .add_header(
            HeaderName::from_static("x-user-id"),
            HeaderValue::from_static("someone-else"),
        )
        .json(&json!({ "name": "payslip.pdf" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_unknown_path_returns_envelope() {
    let backend = MockServer::start().await;
    let server = server_for(state_for(&backend, 100, 1024));

    let response = server.get("/api/v2/unknown").await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    let header_id = response
        .headers()
        .get("x-correlation-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(body["metadata"]["correlation_id"], header_id);
}

#[tokio::test]
async fn test_missing_token_never_reaches_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 100, 1024));
    let response = server.get("/api/v1/loans/1").await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_public_path_skips_authentication() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t" })))
        .expect(1)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 100, 1024));
    let response = server
        .post("/api/v1/auth/login")
        .json(&json!({ "username": "a", "password": "b" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_user_quota_is_enforced() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 2, 1024));
    let token = bearer("user-3", &["borrower"]);
    for _ in 0..2 {
        let ok = server
            .get("/api/v1/documents/1")
            .add_header(header::AUTHORIZATION, token.clone())
            .await;
        assert_eq!(ok.status_code(), StatusCode::OK);
    }

    let limited = server
        .get("/api/v1/documents/1")
        .add_header(header::AUTHORIZATION, token)
        .await;
    assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(limited.headers().get("x-rate-limit-remaining").unwrap(), "0");
    let body: Value = limited.json();
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_failing_backend_opens_circuit() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/loans/9"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&backend)
        .await;

    let state = state_for(&backend, 100, 1024);
    let server = server_for(state.clone());
    let token = bearer("user-4", &["borrower"]);

    for _ in 0..2 {
        let failed = server
            .get("/api/v1/loans/9")
            .add_header(header::AUTHORIZATION, token.clone())
            .await;
        assert_eq!(failed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failed.headers().get("x-rate-limit-remaining").is_some());
    }

    let rejected = server
        .get("/api/v1/loans/9")
        .add_header(header::AUTHORIZATION, token)
        .await;
    assert_eq!(rejected.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(rejected.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(rejected.headers().get("x-rate-limit-remaining").unwrap(), "97");
    let body: Value = rejected.json();
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");

    let breaker = state.breakers.get("loan-service").unwrap();
    assert_eq!(breaker.state().label(), "open");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let server = server_for(state_for(&backend, 100, 16));
    let response = server
        .post("/api/v1/documents")
        .add_header(header::AUTHORIZATION, bearer("user-5", &["borrower"]))
        .text("this body is longer than sixteen bytes")
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_liveness_endpoints() {
    let backend = MockServer::start().await;
    let server = server_for(state_for(&backend, 100, 1024));

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    let body: Value = health.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["uptime_seconds"].is_u64());
    assert_eq!(body["signing_keys"]["degraded"], false);

    let healthz = server.get("/healthz").await;
    assert_eq!(healthz.json::<Value>(), json!({ "status": "OK" }));
}

/// Serves the shared secret once, then behaves like an unreachable key server
struct OneShotKeySource {
    fetches: AtomicU32,
}

#[async_trait]
impl KeySource for OneShotKeySource {
    async fn fetch_key(&self) -> Result<DecodingKey, KeySourceError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(DecodingKey::from_secret(SECRET.as_bytes()))
        } else {
            Err(KeySourceError::Unreachable("connection refused".to_string()))
        }
    }

    fn describe(&self) -> String {
        "one-shot".to_string()
    }
}

#[tokio::test]
async fn test_key_source_outage_shows_in_health() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&backend)
        .await;

    let yaml = config_yaml(&backend.uri(), 100, 1024).replace(
        "auth:\n",
        "auth:\n  key_cache_ttl: \"10ms\"\n  key_refresh_attempts: 1\n",
    );
    let config = GatewayConfig::from_yaml_str(&yaml).unwrap();
    let source = Arc::new(OneShotKeySource {
        fetches: AtomicU32::new(0),
    });
    let collaborators = Collaborators {
        key_source: source.clone(),
        ..Collaborators::from_config(&config).unwrap()
    };
    let server = server_for(AppState::new(config, collaborators, None).unwrap());
    let token = bearer("user-8", &["borrower"]);

    let first = server
        .get("/api/v1/documents/1")
        .add_header(header::AUTHORIZATION, token.clone())
        .await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(server.get("/health").await.json::<Value>()["status"], "healthy");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stale = server
        .get("/api/v1/documents/1")
        .add_header(header::AUTHORIZATION, token)
        .await;
    assert_eq!(stale.status_code(), StatusCode::OK);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    let body: Value = health.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["signing_keys"]["degraded"], true);
    assert!(body["signing_keys"]["last_error"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn test_readiness_follows_critical_services() {
    let backend = MockServer::start().await;
    let state = state_for(&backend, 100, 1024);
    let server = server_for(state.clone());

    assert_eq!(server.get("/ready").await.status_code(), StatusCode::OK);

    // A non-critical service going down keeps the gateway ready.
    for _ in 0..3 {
        state
            .health
            .record_probe("document-service", Err(ProbeError::BadStatus(503)));
    }
    assert_eq!(server.get("/ready").await.status_code(), StatusCode::OK);

    for _ in 0..3 {
        state.health.record_probe(
            "loan-service",
            Err(ProbeError::Timeout(Duration::from_secs(5))),
        );
    }
    let not_ready = server.get("/ready").await;
    assert_eq!(not_ready.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = not_ready.json();
    assert_eq!(body["ready"], false);
    assert_eq!(body["failing"], json!(["loan-service"]));
    assert!(body["message"].as_str().unwrap().contains("loan-service"));
}

#[tokio::test]
async fn test_discovery_lists_services_and_limits() {
    let backend = MockServer::start().await;
    let server = server_for(state_for(&backend, 25, 1024));

    let response = server.get("/api/v1/discovery").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 3);
    let loans = services
        .iter()
        .find(|s| s["name"] == "loan-service")
        .unwrap();
    assert_eq!(loans["base_path"], "/api/v1/loans");
    assert_eq!(loans["status"], "unknown");
    assert_eq!(body["rate_limits"]["per_user"], 25);
    assert_eq!(body["rate_limits"]["window_seconds"], 60);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_exposition() {
    let backend = MockServer::start().await;
    let config =
        GatewayConfig::from_yaml_str(&config_yaml(&backend.uri(), 100, 1024)).unwrap();
    let recorder = metrics::local_recorder().unwrap();
    let state = AppState::from_config(config, Some(recorder.handle())).unwrap();
    let server = server_for(state);

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let backend = MockServer::start().await;
    let server = server_for(state_for(&backend, 100, 1024));

    let forbidden = server
        .get("/api/v1/admin/services")
        .add_header(header::AUTHORIZATION, bearer("user-6", &["borrower"]))
        .await;
    assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);

    let allowed = server
        .get("/api/v1/admin/services")
        .add_header(header::AUTHORIZATION, bearer("ops", &["admin"]))
        .await;
    assert_eq!(allowed.status_code(), StatusCode::OK);
    let body: Value = allowed.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_config_file_round_trip_into_state() {
    let backend = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("gateway.yaml");
    std::fs::write(&file, config_yaml(&backend.uri(), 100, 1024)).unwrap();

    let config = GatewayConfig::load_from_file(&file).await.unwrap();
    let state = AppState::from_config(config, None).unwrap();

    let route = state.registry.resolve("/api/v1/loans/1/schedule").unwrap();
    assert_eq!(route.name, "loan-service");
    assert_eq!(route.circuit_breaker_threshold, 2);
    assert_eq!(state.limiter.backend(), "memory");
}
