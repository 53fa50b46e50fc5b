//! # Request Dispatcher
//!
//! Runs the per-request pipeline in a fixed order:
//!
//! 1. route resolution
//! 2. authentication (skipped for public paths)
//! 3. rate limiting
//! 4. circuit breaker admission
//! 5. forwarding, with retries for idempotent methods
//!
//! The correlation id is already assigned by the request-context middleware
//! before the dispatcher sees the request. Every stage short-circuits into the
//! standardized error envelope and is logged with its stage name.
//!
//! Exactly one outcome is recorded into the service's breaker per admitted
//! request. If the client goes away while the backend call is in flight, the
//! dispatch future is dropped and [`OutcomeGuard`] records a failure instead.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::auth::claims::{extract_bearer, ClaimsValidator};
use crate::auth::is_public_path;
use crate::core::circuit_breaker::{
    BreakerPermit, BreakerSettings, CircuitBreaker, CircuitBreakerRegistry, Outcome,
};
use crate::core::error::{GatewayError, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER};
use crate::core::retry::RetryDecision;
use crate::core::types::{RequestContext, ServiceRoute};
use crate::gateway::forwarder::{
    outbound_headers, relayed_headers, ForwardError, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
use crate::middleware::rate_limiting::{Allowance, RateLimiter};
use crate::observability::correlation::CorrelationId;
use crate::observability::health::HealthMonitor;
use crate::observability::metrics;
use crate::routing::registry::{normalize_path, ServiceRegistry};

/// Pipeline stage, used as a structured log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Route,
    Auth,
    RateLimit,
    Breaker,
    Forward,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Breaker => "breaker",
            Self::Forward => "forward",
        }
    }
}

/// A request as seen by the dispatcher, body already buffered
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub correlation_id: CorrelationId,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

struct StageError {
    stage: Stage,
    service: Option<String>,
    error: GatewayError,
    /// Set once the rate limiter has counted the request
    allowance: Option<Allowance>,
}

impl StageError {
    fn new(stage: Stage, service: Option<&str>, error: impl Into<GatewayError>) -> Self {
        Self {
            stage,
            service: service.map(str::to_string),
            error: error.into(),
            allowance: None,
        }
    }

    fn with_allowance(mut self, allowance: Option<Allowance>) -> Self {
        self.allowance = allowance;
        self
    }
}

/// Records a failure for a permit that never got an explicit outcome
struct OutcomeGuard {
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    permit: Option<BreakerPermit>,
}

impl OutcomeGuard {
    fn new(breaker: Arc<CircuitBreaker>, health: Arc<HealthMonitor>, permit: BreakerPermit) -> Self {
        Self {
            breaker,
            health,
            permit: Some(permit),
        }
    }

    fn complete(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            self.record(permit, outcome);
        }
    }

    fn record(&self, permit: BreakerPermit, outcome: Outcome) {
        if let Some(transition) = self.breaker.record(permit, outcome) {
            self.health.observe_breaker(self.breaker.name(), transition);
        }
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            warn!(
                service = %self.breaker.name(),
                stage = Stage::Forward.as_str(),
                "Request abandoned before the backend answered, recording failure"
            );
            self.record(permit, Outcome::Failure);
        }
    }
}

/// The request dispatch pipeline
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    validator: Arc<ClaimsValidator>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    upstream: Arc<dyn UpstreamClient>,
    public_paths: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        validator: Arc<ClaimsValidator>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<HealthMonitor>,
        upstream: Arc<dyn UpstreamClient>,
        public_paths: Vec<String>,
    ) -> Self {
        Self {
            registry,
            validator,
            limiter,
            breakers,
            health,
            upstream,
            public_paths,
        }
    }

    /// Run the pipeline and produce the client response
    pub async fn dispatch(&self, request: InboundRequest) -> Response {
        let correlation_id = request.correlation_id.clone();
        let started = std::time::Instant::now();

        let (service, response) = match self.run(request).await {
            Ok((route, response)) => (route.name.clone(), response),
            Err(failure) => {
                let status = failure.error.status_code();
                let service = failure.service.as_deref().unwrap_or("unmatched");
                if status.is_server_error() {
                    error!(
                        correlation_id = %correlation_id,
                        stage = failure.stage.as_str(),
                        service = %service,
                        error = %failure.error,
                        error_type = failure.error.error_type(),
                        retryable = failure.error.is_retryable(),
                        "Request failed"
                    );
                } else {
                    warn!(
                        correlation_id = %correlation_id,
                        stage = failure.stage.as_str(),
                        service = %service,
                        error = %failure.error,
                        error_type = failure.error.error_type(),
                        retryable = failure.error.is_retryable(),
                        "Request rejected"
                    );
                }
                let service = service.to_string();
                let envelope = failure.error.into_envelope(Some(correlation_id.as_str()));
                (service, with_allowance(envelope, failure.allowance))
            }
        };

        metrics::record_request(&service, response.status().as_u16(), started.elapsed());
        response
    }

    async fn run(
        &self,
        request: InboundRequest,
    ) -> Result<(Arc<ServiceRoute>, Response), StageError> {
        let path =
            normalize_path(&request.path).map_err(|e| StageError::new(Stage::Route, None, e))?;
        let route = self
            .registry
            .resolve(&path)
            .map_err(|e| StageError::new(Stage::Route, None, e))?;
        let service = Some(route.name.as_str());

        let mut ctx = RequestContext::new(
            request.correlation_id.clone(),
            request.client_ip,
            request.method.clone(),
            path,
        );

        if !is_public_path(&self.public_paths, &ctx.path) {
            let token = extract_bearer(&request.headers)
                .map_err(|e| StageError::new(Stage::Auth, service, e))?;
            let claims = self
                .validator
                .validate(token)
                .await
                .map_err(|e| StageError::new(Stage::Auth, service, e))?;
            ctx.attach_identity(&claims);
        }

        let allowance = self
            .limiter
            .check(&ctx, &route)
            .await
            .map_err(|e| StageError::new(Stage::RateLimit, service, e))?;

        let breaker = self.breakers.get_or_create(&route.name);
        let permit = breaker
            .admit(BreakerSettings::from(route.as_ref()))
            .map_err(|e| {
                metrics::record_circuit_rejection(&route.name);
                StageError::new(Stage::Breaker, service, e).with_allowance(allowance)
            })?;
        let guard = OutcomeGuard::new(breaker, Arc::clone(&self.health), permit);

        let upstream_request = UpstreamRequest {
            url: route
                .upstream_url(&ctx.path, request.query.as_deref())
                .map_err(|e| {
                    StageError::new(Stage::Forward, service, e).with_allowance(allowance)
                })?,
            method: request.method,
            headers: outbound_headers(&request.headers, &ctx),
            body: request.body,
        };

        let result = self
            .forward(&ctx, &route, &upstream_request)
            .await
            .map_err(|e| forward_error(&route, e))
            .and_then(|upstream| {
                if upstream.status.is_server_error() {
                    Err(GatewayError::UpstreamStatus {
                        service: route.name.clone(),
                        status: upstream.status.as_u16(),
                    })
                } else {
                    Ok(upstream)
                }
            });
        guard.complete(match &result {
            Err(e) if e.should_trigger_circuit_breaker() => Outcome::Failure,
            _ => Outcome::Success,
        });

        let response = result.map(relay).map_err(|e| {
            StageError::new(Stage::Forward, service, e).with_allowance(allowance)
        })?;
        Ok((route, with_allowance(response, allowance)))
    }

    async fn forward(
        &self,
        ctx: &RequestContext,
        route: &ServiceRoute,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, ForwardError> {
        let policy = route.retry_policy();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match self.upstream.send(request, route.request_timeout).await {
                Ok(response) => {
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        service = %route.name,
                        status = response.status.as_u16(),
                        attempts,
                        "Forwarded request"
                    );
                    return Ok(response);
                }
                Err(e) => e,
            };

            match policy.decide(&ctx.method, attempts, error.kind()) {
                RetryDecision::Retry { delay } => {
                    let delay = policy.backoff.jittered(delay);
                    info!(
                        correlation_id = %ctx.correlation_id,
                        stage = Stage::Forward.as_str(),
                        service = %route.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying upstream request"
                    );
                    metrics::record_retry(&route.name);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }
}

fn forward_error(route: &ServiceRoute, error: ForwardError) -> GatewayError {
    match error {
        ForwardError::Timeout(timeout) => GatewayError::Timeout {
            service: route.name.clone(),
            timeout_ms: duration_millis(timeout),
        },
        ForwardError::Connect(reason) | ForwardError::Other(reason) => {
            GatewayError::UpstreamConnection {
                service: route.name.clone(),
                reason,
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = (upstream.status, Body::from(upstream.body)).into_response();
    *response.headers_mut() = relayed_headers(&upstream.headers);
    response
}

fn with_allowance(mut response: Response, allowance: Option<Allowance>) -> Response {
    if let Some(allowance) = allowance {
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(allowance.remaining));
        if let Ok(value) = HeaderValue::from_str(&allowance.reset_at.to_rfc3339()) {
            headers.insert(RATE_LIMIT_RESET_HEADER, value);
        }
    }
    response
}
