//! Core data structures shared by the dispatch pipeline.

use axum::http::Method;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use url::Url;

use crate::auth::claims::Claims;
use crate::core::config::ServiceDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::retry::{BackoffPolicy, RetryPolicy};
use crate::observability::correlation::CorrelationId;
use crate::routing::registry::normalize_path;

/// Per-request state, created at ingress and dropped after the response is sent.
///
/// Identity fields start empty and are filled in once by
/// [`RequestContext::attach_identity`] after the token has been validated.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub roles: BTreeSet<String>,
    pub client_ip: Option<IpAddr>,
    pub method: Method,
    /// Normalized request path
    pub path: String,
    pub received_at: DateTime<Utc>,
    /// Monotonic start, for latency measurements
    pub started: Instant,
}

impl RequestContext {
    pub fn new(
        correlation_id: CorrelationId,
        client_ip: Option<IpAddr>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            user_id: None,
            tenant_id: None,
            roles: BTreeSet::new(),
            client_ip,
            method,
            path: path.into(),
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Copy validated identity claims onto the context
    pub fn attach_identity(&mut self, claims: &Claims) {
        self.user_id = Some(claims.user_id.clone());
        self.tenant_id = Some(claims.tenant_id.clone());
        self.roles = claims.roles.iter().cloned().collect();
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Client IP rendered for rate-limit keys and forwarding headers
    pub fn client_ip_string(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// One routable backend service.
///
/// Values are immutable once published in the registry; a runtime update swaps
/// in a new `Arc<ServiceRoute>` and requests already holding the old one keep it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoute {
    pub name: String,
    /// Normalized prefix, never ending in `/` (except the root prefix `/`)
    pub path_prefix: String,
    pub target: Url,
    pub health_check_path: String,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub circuit_breaker_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub half_open_probe_interval: Duration,
    pub is_critical: bool,
}

impl ServiceRoute {
    /// Build a route from its configuration entry, normalizing the prefix
    pub fn from_definition(name: &str, definition: &ServiceDefinition) -> GatewayResult<Self> {
        let path_prefix = normalize_path(&definition.path_prefix).map_err(|e| {
            GatewayError::config(format!("services.{}.path_prefix: {}", name, e))
        })?;

        Ok(Self {
            name: name.to_string(),
            path_prefix,
            target: definition.url.clone(),
            health_check_path: definition.health_check_path.clone(),
            health_check_interval: definition.health_check_interval,
            request_timeout: definition.request_timeout,
            max_retries: definition.max_retries,
            backoff: definition.retry_backoff,
            circuit_breaker_threshold: definition.circuit_breaker_threshold,
            half_open_probe_interval: definition.half_open_probe_interval,
            is_critical: definition.critical,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff)
    }

    /// Absolute URL for a request path (and optional query) on this target
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> GatewayResult<Url> {
        let base = self.target.as_str().trim_end_matches('/');
        let raw = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path, q),
            _ => format!("{}{}", base, path),
        };
        Url::parse(&raw).map_err(|e| {
            GatewayError::internal(format!("Invalid upstream URL for {}: {}", self.name, e))
        })
    }

    pub fn health_check_url(&self) -> GatewayResult<Url> {
        self.upstream_url(&self.health_check_path, None)
    }
}

/// Route with default settings, for tests across the crate
#[cfg(test)]
pub(crate) fn test_route(name: &str, prefix: &str, target: &str) -> ServiceRoute {
    ServiceRoute {
        name: name.to_string(),
        path_prefix: prefix.to_string(),
        target: Url::parse(target).expect("test target URL"),
        health_check_path: "/health".to_string(),
        health_check_interval: Duration::from_secs(30),
        request_timeout: Duration::from_secs(30),
        max_retries: 3,
        backoff: BackoffPolicy::default(),
        circuit_breaker_threshold: 5,
        half_open_probe_interval: Duration::from_secs(60),
        is_critical: true,
    }
}
