//! # Admin Endpoints
//!
//! Operator API mounted under `/api/v1/admin`. Every route sits behind
//! [`require_admin`], and every response uses the same envelope as gateway
//! errors: `{success, data, error, metadata}`.
//!
//! | Method | Path                               | Purpose                          |
//! |--------|------------------------------------|----------------------------------|
//! | GET    | `/gateway/status`                  | uptime, health, breakers, keys   |
//! | GET    | `/rate-limits`                     | usage for a user, tenant or ip   |
//! | GET    | `/rate-limits/config`              | current limits                   |
//! | POST   | `/rate-limits/config`              | replace limits at runtime        |
//! | GET    | `/services`                        | routes with their health         |
//! | PUT    | `/services/:name`                  | add or replace one route         |
//! | GET    | `/circuit-breakers`                | breaker state per route          |
//! | POST   | `/circuit-breakers/:name/reset`    | force a breaker closed           |

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

use crate::admin::guard::require_admin;
use crate::auth::keys::KeyCacheStatus;
use crate::core::circuit_breaker::CircuitBreakerSnapshot;
use crate::core::config::{RateLimitSettings, ServiceDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceRoute;
use crate::gateway::server::AppState;
use crate::observability::correlation;
use crate::observability::health::{Readiness, ServiceHealth};
use crate::routing::registry::RegistryError;

/// Admin router
pub struct AdminRouter;

impl AdminRouter {
    /// Create the admin routes; the caller supplies the state when nesting
    pub fn create_router(state: AppState) -> Router<AppState> {
        Router::new()
            .route("/gateway/status", get(gateway_status))
            .route("/rate-limits", get(rate_limit_usage))
            .route(
                "/rate-limits/config",
                get(get_rate_limit_config).post(update_rate_limit_config),
            )
            .route("/services", get(list_services))
            .route("/services/:name", put(replace_service))
            .route("/circuit-breakers", get(list_circuit_breakers))
            .route("/circuit-breakers/:name/reset", post(reset_circuit_breaker))
            .route_layer(from_fn_with_state(state, require_admin))
    }
}

/// Wrap `data` in the success envelope
fn envelope<T: Serialize>(data: T) -> Json<Value> {
    let correlation_id = correlation::current();
    Json(json!({
        "success": true,
        "data": data,
        "error": null,
        "metadata": {
            "timestamp": Utc::now().to_rfc3339(),
            "correlation_id": correlation_id.as_ref().map(|id| id.as_str()),
        }
    }))
}

fn body_error(rejection: JsonRejection) -> GatewayError {
    GatewayError::validation("body", rejection.body_text())
}

#[derive(Debug, Serialize)]
struct GatewayStatus {
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_seconds: u64,
    readiness: Readiness,
    services: BTreeMap<String, ServiceHealth>,
    circuit_breakers: Vec<CircuitBreakerSnapshot>,
    signing_keys: KeyCacheStatus,
    rate_limit_backend: &'static str,
}

async fn gateway_status(State(state): State<AppState>) -> Json<Value> {
    envelope(GatewayStatus {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_seconds: state.uptime_secs(),
        readiness: state.health.readiness(),
        services: state.health.snapshot(),
        circuit_breakers: state.breakers.snapshots(),
        signing_keys: state.validator.keys().status(),
        rate_limit_backend: state.limiter.backend(),
    })
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    user_id: Option<String>,
    tenant_id: Option<String>,
    ip: Option<String>,
}

async fn rate_limit_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> GatewayResult<Json<Value>> {
    if query.user_id.is_none() && query.tenant_id.is_none() && query.ip.is_none() {
        return Err(GatewayError::validation(
            "query",
            "one of user_id, tenant_id or ip is required",
        ));
    }

    let usage = state
        .limiter
        .status(
            query.user_id.as_deref(),
            query.tenant_id.as_deref(),
            query.ip.as_deref(),
        )
        .await?;
    Ok(envelope(json!({
        "backend": state.limiter.backend(),
        "scopes": usage,
    })))
}

async fn get_rate_limit_config(State(state): State<AppState>) -> Json<Value> {
    let settings = state.limiter.settings();
    envelope(settings.as_ref())
}

async fn update_rate_limit_config(
    State(state): State<AppState>,
    payload: Result<Json<RateLimitSettings>, JsonRejection>,
) -> GatewayResult<Json<Value>> {
    let Json(settings) = payload.map_err(body_error)?;
    state.limiter.update_settings(settings)?;
    let current = state.limiter.settings();
    Ok(envelope(current.as_ref()))
}

#[derive(Debug, Serialize)]
struct ServiceView<'a> {
    #[serde(flatten)]
    route: &'a ServiceRoute,
    health: ServiceHealth,
}

async fn list_services(State(state): State<AppState>) -> Json<Value> {
    let routes = state.registry.routes();
    let views: Vec<ServiceView<'_>> = routes
        .iter()
        .map(|route| ServiceView {
            route,
            health: state.health.health(&route.name),
        })
        .collect();
    envelope(views)
}

/// Body of `PUT /services/:name`
#[derive(Debug, Deserialize)]
struct ServiceUpdate {
    #[serde(flatten)]
    definition: ServiceDefinition,
    /// Probe the new target's health path before publishing it
    #[serde(default)]
    verify_reachability: bool,
}

async fn replace_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<ServiceUpdate>, JsonRejection>,
) -> GatewayResult<Json<Value>> {
    let Json(update) = payload.map_err(body_error)?;
    update.definition.validate(&name)?;
    let route = ServiceRoute::from_definition(&name, &update.definition)?;

    let verifier = update.verify_reachability.then_some(state.probe.as_ref());
    let route = state
        .registry
        .replace(&name, route, verifier)
        .await
        .map_err(|e| match e {
            RegistryError::PrefixConflict { .. } => {
                GatewayError::validation("path_prefix", e.to_string())
            }
            other => other.into(),
        })?;

    info!(service = %name, target = %route.target, "Service route updated via admin API");
    Ok(envelope(ServiceView {
        route: &route,
        health: state.health.health(&name),
    }))
}

async fn list_circuit_breakers(State(state): State<AppState>) -> Json<Value> {
    // Routes that never saw traffic still get a (closed) breaker listed.
    for route in state.registry.routes() {
        state.breakers.get_or_create(&route.name);
    }
    envelope(state.breakers.snapshots())
}

async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> GatewayResult<Json<Value>> {
    let breaker = match state.breakers.get(&name) {
        Some(breaker) => breaker,
        None if state.registry.get(&name).is_some() => state.breakers.get_or_create(&name),
        None => {
            return Err(GatewayError::not_found(format!(
                "/api/v1/admin/circuit-breakers/{}/reset",
                name
            )))
        }
    };

    breaker.reset();
    info!(service = %name, "Circuit breaker reset via admin API");
    Ok(envelope(breaker.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authz::RoleChecker;
    use crate::auth::keys::StaticKeySource;
    use crate::core::circuit_breaker::{BreakerSettings, Outcome};
    use crate::core::config::GatewayConfig;
    use crate::gateway::forwarder::HttpUpstreamClient;
    use crate::gateway::server::{build_router, Collaborators};
    use crate::middleware::rate_limiting::InMemoryCounterStore;
    use crate::observability::health::{HealthProbe, ProbeError};
    use async_trait::async_trait;
    use axum::http::{header, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use jsonwebtoken::{EncodingKey, Header};
    use std::sync::Arc;

    const SECRET: &[u8] = b"admin-test-secret";

    const CONFIG: &str = r#"
auth:
  secret: "admin-test-secret"
rate_limiting:
  per_user: 5
services:
  loan-service:
    url: "http://127.0.0.1:8005"
    path_prefix: "/api/v1/loans"
    circuit_breaker_threshold: 1
  document-service:
    url: "http://127.0.0.1:8003"
    path_prefix: "/api/v1/documents"
    critical: false
"#;

    struct FixedProbe {
        reachable: bool,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _route: &ServiceRoute) -> Result<(), ProbeError> {
            if self.reachable {
                Ok(())
            } else {
                Err(ProbeError::Unreachable("connection refused".to_string()))
            }
        }
    }

    /// Grants admin to one delegated user only
    struct DelegatedAdmin;

    #[async_trait]
    impl RoleChecker for DelegatedAdmin {
        async fn has_role(&self, user_id: &str, _tenant_id: &str, role: &str) -> bool {
            user_id == "delegated" && role == "admin"
        }
    }

    fn state(reachable: bool) -> AppState {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let collaborators = Collaborators {
            key_source: Arc::new(StaticKeySource::hmac(SECRET)),
            counter_store: Arc::new(InMemoryCounterStore::new()),
            upstream: Arc::new(HttpUpstreamClient::new().unwrap()),
            probe: Arc::new(FixedProbe { reachable }),
            role_checker: Some(Arc::new(DelegatedAdmin)),
        };
        AppState::new(config, collaborators, None).unwrap()
    }

    fn token(user_id: &str, roles: &[&str]) -> HeaderValue {
        let now = Utc::now().timestamp();
        let claims = json!({
            "user_id": user_id,
            "tenant_id": "tenant-1",
            "roles": roles,
            "iat": now,
            "exp": now + 3600,
        });
        let jwt = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        HeaderValue::from_str(&format!("Bearer {}", jwt)).unwrap()
    }

    fn admin() -> HeaderValue {
        token("ops-1", &["admin"])
    }

    fn server(state: AppState) -> TestServer {
        TestServer::new(build_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let server = server(state(true));
        let response = server.get("/api/v1/admin/gateway/status").await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_non_admin_is_forbidden() {
        let server = server(state(true));
        let response = server
            .get("/api/v1/admin/gateway/status")
            .add_header(header::AUTHORIZATION, token("user-1", &["borrower"]))
            .await;

        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_role_checker_can_grant_admin() {
        let server = server(state(true));
        let response = server
            .get("/api/v1/admin/gateway/status")
            .add_header(header::AUTHORIZATION, token("delegated", &["borrower"]))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_gateway_status() {
        let server = server(state(true));
        let response = server
            .get("/api/v1/admin/gateway/status")
            .add_header(header::AUTHORIZATION, admin())
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert!(body["metadata"]["correlation_id"].is_string());
        let data = &body["data"];
        assert_eq!(data["rate_limit_backend"], "memory");
        assert_eq!(data["services"]["loan-service"]["status"], "unknown");
        assert_eq!(data["signing_keys"]["degraded"], false);
    }

    #[tokio::test]
    async fn test_rate_limit_usage_requires_an_identity() {
        let server = server(state(true));
        let response = server
            .get("/api/v1/admin/rate-limits")
            .add_header(header::AUTHORIZATION, admin())
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit_usage_for_user() {
        let server = server(state(true));
        let response = server
            .get("/api/v1/admin/rate-limits?user_id=user-9")
            .add_header(header::AUTHORIZATION, admin())
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        let scopes = body["data"]["scopes"].as_array().unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0]["scope"], "user");
        assert_eq!(scopes[0]["limit"], 5);
        assert_eq!(scopes[0]["remaining"], 5);
    }

    #[tokio::test]
    async fn test_update_rate_limit_config() {
        let state = state(true);
        let server = server(state.clone());
        let response = server
            .post("/api/v1/admin/rate-limits/config")
            .add_header(header::AUTHORIZATION, admin())
            .json(&json!({ "window": "10s", "per_user": 2 }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(state.limiter.settings().per_user, 2);
        assert_eq!(state.limiter.settings().window.as_secs(), 10);

        let invalid = server
            .post("/api/v1/admin/rate-limits/config")
            .add_header(header::AUTHORIZATION, admin())
            .json(&json!({ "per_user": 0 }))
            .await;
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(state.limiter.settings().per_user, 2);
    }

    #[tokio::test]
    async fn test_replace_service_updates_routing() {
        let state = state(true);
        let server = server(state.clone());
        let response = server
            .put("/api/v1/admin/services/loan-service")
            .add_header(header::AUTHORIZATION, admin())
            .json(&json!({
                "url": "http://127.0.0.1:9105",
                "path_prefix": "/api/v1/loans/",
                "request_timeout": "3s",
                "verify_reachability": true,
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["data"]["path_prefix"], "/api/v1/loans");

        let route = state.registry.resolve("/api/v1/loans/42").unwrap();
        assert_eq!(route.target.as_str(), "http://127.0.0.1:9105/");
        assert_eq!(route.request_timeout.as_secs(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_not_published() {
        let state = state(false);
        let server = server(state.clone());
        let response = server
            .put("/api/v1/admin/services/loan-service")
            .add_header(header::AUTHORIZATION, admin())
            .json(&json!({
                "url": "http://127.0.0.1:9105",
                "path_prefix": "/api/v1/loans",
                "verify_reachability": true,
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let route = state.registry.get("loan-service").unwrap();
        assert_eq!(route.target.as_str(), "http://127.0.0.1:8005/");
    }

    #[tokio::test]
    async fn test_conflicting_prefix_is_rejected() {
        let state = state(true);
        let server = server(state.clone());
        let response = server
            .put("/api/v1/admin/services/audit-service")
            .add_header(header::AUTHORIZATION, admin())
            .json(&json!({
                "url": "http://127.0.0.1:8007",
                "path_prefix": "/api/v1/documents",
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert!(state.registry.get("audit-service").is_none());
    }

    #[tokio::test]
    async fn test_list_and_reset_circuit_breakers() {
        let state = state(true);
        let server = server(state.clone());

        let breaker = state.breakers.get_or_create("loan-service");
        let route = state.registry.get("loan-service").unwrap();
        let permit = breaker.admit(BreakerSettings::from(route.as_ref())).unwrap();
        breaker.record(permit, Outcome::Failure);

        let response = server
            .get("/api/v1/admin/circuit-breakers")
            .add_header(header::AUTHORIZATION, admin())
            .await;
        let body: Value = response.json();
        let breakers = body["data"].as_array().unwrap();
        assert_eq!(breakers.len(), 2);
        let loan = breakers
            .iter()
            .find(|b| b["name"] == "loan-service")
            .unwrap();
        assert_eq!(loan["state"], "open");

        let reset = server
            .post("/api/v1/admin/circuit-breakers/loan-service/reset")
            .add_header(header::AUTHORIZATION, admin())
            .await;
        assert_eq!(reset.status_code(), StatusCode::OK);
        let body: Value = reset.json();
        assert_eq!(body["data"]["state"], "closed");

        let unknown = server
            .post("/api/v1/admin/circuit-breakers/nope/reset")
            .add_header(header::AUTHORIZATION, admin())
            .await;
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
    }
}
