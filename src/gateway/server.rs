//! # HTTP Server Module
//!
//! Wires every component into one axum application:
//!
//! - `/health`, `/healthz`, `/ready`: liveness and readiness
//! - `/api/v1/discovery`: public service catalogue
//! - `/metrics`: Prometheus exposition, when enabled
//! - `/api/v1/admin/...`: operator endpoints, admin role required
//! - everything else: the dispatch pipeline
//!
//! ## Layer order
//! The request-context middleware is outermost, so every response (CORS
//! preflights, admin rejections and proxied responses alike) carries the
//! correlation id and the security headers. `TraceLayer` sits inside it and
//! its spans nest under the request span.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::admin::AdminRouter;
use crate::auth::authz::{HttpRoleChecker, RoleChecker};
use crate::auth::claims::ClaimsValidator;
use crate::auth::keys::{key_source_from_config, KeyCacheSettings, KeySource, SigningKeyCache};
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::{CorsConfig, CounterStoreConfig, GatewayConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::dispatcher::{Dispatcher, InboundRequest};
use crate::gateway::forwarder::{HttpUpstreamClient, UpstreamClient};
use crate::middleware::rate_limiting::{
    CounterStore, InMemoryCounterStore, RateLimiter, RedisCounterStore,
};
use crate::middleware::request_context::{request_context, ResponseHeaderPolicy};
use crate::observability::correlation::{self, CorrelationId};
use crate::observability::health::{HealthMonitor, HealthProbe, HttpHealthProbe, ServiceStatus};
use crate::routing::registry::ServiceRegistry;

/// External collaborators, each behind a trait so tests can substitute them
#[derive(Clone)]
pub struct Collaborators {
    pub key_source: Arc<dyn KeySource>,
    pub counter_store: Arc<dyn CounterStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub probe: Arc<dyn HealthProbe>,
    pub role_checker: Option<Arc<dyn RoleChecker>>,
}

impl Collaborators {
    /// The production implementations named by the configuration
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let counter_store: Arc<dyn CounterStore> = match &config.rate_limiting.store {
            CounterStoreConfig::Memory => Arc::new(InMemoryCounterStore::new()),
            CounterStoreConfig::Redis { url, .. } => Arc::new(RedisCounterStore::new(url)?),
        };

        let role_checker = match &config.auth.authz_service_url {
            Some(url) => Some(
                Arc::new(HttpRoleChecker::new(url, config.auth.authz_timeout)?) as Arc<dyn RoleChecker>,
            ),
            None => None,
        };

        Ok(Self {
            key_source: key_source_from_config(&config.auth)?,
            counter_store,
            upstream: Arc::new(HttpUpstreamClient::new()?),
            probe: Arc::new(HttpHealthProbe::new(config.health.probe_timeout)?),
            role_checker,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub validator: Arc<ClaimsValidator>,
    pub role_checker: Option<Arc<dyn RoleChecker>>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub health: Arc<HealthMonitor>,
    pub probe: Arc<dyn HealthProbe>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        collaborators: Collaborators,
        metrics: Option<PrometheusHandle>,
    ) -> GatewayResult<Self> {
        let registry = Arc::new(ServiceRegistry::from_routes(config.service_routes()?)?);

        let keys = Arc::new(SigningKeyCache::new(
            collaborators.key_source,
            KeyCacheSettings::from(&config.auth),
        ));
        let validator = Arc::new(ClaimsValidator::new(
            keys,
            config.auth.algorithm,
            config.auth.leeway.as_secs(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limiting.clone(),
            collaborators.counter_store,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&collaborators.probe),
            &config.health,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&validator),
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            Arc::clone(&health),
            collaborators.upstream,
            config.auth.public_paths.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            validator,
            role_checker: collaborators.role_checker,
            limiter,
            breakers,
            health,
            probe: collaborators.probe,
            dispatcher,
            metrics,
            started_at: Utc::now(),
            started: Instant::now(),
        })
    }

    /// Build the state with the production collaborators
    pub fn from_config(
        config: GatewayConfig,
        metrics: Option<PrometheusHandle>,
    ) -> GatewayResult<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::new(config, collaborators, metrics)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Assemble the full application router
pub fn build_router(state: AppState) -> Router {
    let config = Arc::clone(&state.config);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/api/v1/discovery", get(discovery))
        .nest("/api/v1/admin", AdminRouter::create_router(state.clone()));

    if config.observability.metrics.prometheus_enabled && state.metrics.is_some() {
        router = router.route(
            &config.observability.metrics.endpoint_path,
            get(prometheus_metrics),
        );
    }

    let policy = ResponseHeaderPolicy {
        security_headers: config.server.security_headers,
    };

    let mut router = router.fallback(proxy).with_state(state);
    if let Some(cors) = cors_layer(&config.server.cors) {
        router = router.layer(cors);
    }
    router.layer(
        ServiceBuilder::new()
            .layer(from_fn_with_state(policy, request_context))
            .layer(TraceLayer::new_for_http()),
    )
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let mut layer = CorsLayer::new();
    layer = if config.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer.allow_origin(origins).allow_credentials(true)
    };

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = layer.allow_methods(methods);

    layer = if config.allowed_headers.iter().any(|h| h == "*") {
        if config.allowed_origins.iter().any(|o| o == "*") {
            layer.allow_headers(Any)
        } else {
            // Wildcard headers cannot be combined with credentials.
            layer.allow_headers(tower_http::cors::AllowHeaders::mirror_request())
        }
    } else {
        let headers: Vec<header::HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer.allow_headers(headers)
    };

    Some(layer.expose_headers([
        header::HeaderName::from_static(correlation::CORRELATION_HEADER),
        header::RETRY_AFTER,
    ]))
}

/// Catch-all: everything that is not a gateway endpoint is proxied
async fn proxy(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let correlation_id = parts
        .extensions
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(|| correlation::ensure(&parts.headers));

    let limit = state.config.server.max_request_body_size;
    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return GatewayError::PayloadTooLarge { limit }.into_envelope(Some(correlation_id.as_str()));
    }

    let body = match axum::body::to_bytes(body, limit).await {
        Ok(body) => body,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to read request body");
            return GatewayError::PayloadTooLarge { limit }
                .into_envelope(Some(correlation_id.as_str()));
        }
    };

    state
        .dispatcher
        .dispatch(InboundRequest {
            correlation_id,
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
            client_ip: connect_info.map(|ConnectInfo(addr)| addr.ip()),
        })
        .await
}

/// Health check handler; `degraded` while verifying with a stale signing key
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let signing_keys = state.validator.keys().status();
    let status = if signing_keys.degraded {
        "degraded"
    } else {
        "healthy"
    };
    Json(json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_secs(),
        "signing_keys": signing_keys,
    }))
}

/// Liveness probe
async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

/// Readiness probe: 503 naming the critical services that are down
async fn ready(State(state): State<AppState>) -> Response {
    let readiness = state.health.readiness();
    if readiness.ready {
        return (StatusCode::OK, Json(readiness)).into_response();
    }

    let message = GatewayError::CriticalServiceDown {
        service: readiness.failing.join(", "),
    }
    .to_string();
    warn!(failing = ?readiness.failing, "Readiness check failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "ready": false,
            "message": message,
            "failing": readiness.failing,
            "services": readiness.services,
        })),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct DiscoveredService {
    name: String,
    base_path: String,
    status: ServiceStatus,
    critical: bool,
}

/// Public service catalogue
async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let services: Vec<DiscoveredService> = state
        .registry
        .routes()
        .into_iter()
        .map(|route| DiscoveredService {
            status: state.health.health(&route.name).status,
            name: route.name.clone(),
            base_path: route.path_prefix.clone(),
            critical: route.is_critical,
        })
        .collect();

    let limits = state.limiter.settings();
    Json(json!({
        "services": services,
        "authentication_required": true,
        "rate_limits": {
            "window_seconds": limits.window.as_secs(),
            "per_user": limits.per_user,
            "per_tenant": limits.per_tenant,
            "per_ip": limits.per_ip,
        },
    }))
}

/// Prometheus text exposition
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            Body::from(handle.render()),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// HTTP server with graceful shutdown
pub struct GatewayServer {
    state: AppState,
    bind_addr: SocketAddr,
}

impl GatewayServer {
    pub fn new(state: AppState) -> GatewayResult<Self> {
        let server = &state.config.server;
        let bind_addr: SocketAddr = format!("{}:{}", server.bind_address, server.port)
            .parse()
            .map_err(|e| {
                GatewayError::config(format!(
                    "Invalid bind address {}:{}: {}",
                    server.bind_address, server.port, e
                ))
            })?;
        Ok(Self { state, bind_addr })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| crate::internal_error!("Failed to bind to {}: {}", self.bind_addr, e))?;
        info!(address = %self.bind_addr, "Gateway listening");

        let monitor = if self.state.config.health.enabled {
            Some(self.state.health.start())
        } else {
            info!("Health monitor disabled");
            None
        };

        let grace = self.state.config.server.shutdown_timeout;
        let app = build_router(self.state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let signal = shutdown.clone();
        let mut serve = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .into_future(),
        );

        let result = tokio::select! {
            result = &mut serve => result,
            _ = shutdown.cancelled() => {
                info!(grace_secs = grace.as_secs(), "Shutting down, draining in-flight requests");
                match tokio::time::timeout(grace, &mut serve).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Shutdown grace period elapsed, aborting remaining connections");
                        serve.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        self.state.health.shutdown();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        match result {
            Ok(Ok(())) => {
                info!("Gateway stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(GatewayError::internal(format!("Server error: {}", e))),
            Err(e) => {
                error!(error = %e, "Server task failed");
                Err(GatewayError::internal(format!("Server task failed: {}", e)))
            }
        }
    }
}
