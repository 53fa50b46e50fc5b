//! # Health Monitor
//!
//! Background probing of every registered service and the readiness decision
//! derived from it.
//!
//! ## Key Features
//! - One probe task per route, ticking at the route's `health_check_interval`
//! - Probe tasks follow registry changes: a replaced route gets a fresh task
//!   and its health starts over from `Unknown`
//! - Status transitions are the pure function [`next_health`]
//! - Readiness fails only when a *critical* service is unhealthy
//!
//! Circuit breaker transitions are fed in as well, so a breaker that opens
//! between probes shows up as a degraded service right away.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::BreakerTransition;
use crate::core::config::HealthMonitorConfig;
use crate::core::error::GatewayResult;
use crate::core::types::ServiceRoute;
use crate::observability::metrics;
use crate::routing::registry::{RegistryEvent, ServiceRegistry};

/// Health status of a backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Last probe succeeded
    Healthy,
    /// Failing, but fewer than the unhealthy threshold in a row
    Degraded,
    /// At least the threshold of consecutive probe failures
    Unhealthy,
    /// Not probed yet
    Unknown,
}

impl ServiceStatus {
    fn gauge_value(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy | Self::Unknown => 0.0,
        }
    }
}

/// Health record for one route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: ServiceStatus,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServiceHealth {
    pub fn unknown() -> Self {
        Self {
            status: ServiceStatus::Unknown,
            consecutive_failures: 0,
            last_check_at: None,
            last_error: None,
        }
    }
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Why a probe failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {0}")]
    BadStatus(u16),
}

/// Probe transition
pub fn next_health(
    prev: &ServiceHealth,
    result: &Result<(), ProbeError>,
    unhealthy_threshold: u32,
    now: DateTime<Utc>,
) -> ServiceHealth {
    match result {
        Ok(()) => ServiceHealth {
            status: ServiceStatus::Healthy,
            consecutive_failures: 0,
            last_check_at: Some(now),
            last_error: None,
        },
        Err(e) => {
            let failures = prev.consecutive_failures.saturating_add(1);
            let status = if failures >= unhealthy_threshold.max(1) {
                ServiceStatus::Unhealthy
            } else {
                ServiceStatus::Degraded
            };
            ServiceHealth {
                status,
                consecutive_failures: failures,
                last_check_at: Some(now),
                last_error: Some(e.to_string()),
            }
        }
    }
}

/// Health check probe trait
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, route: &ServiceRoute) -> Result<(), ProbeError>;
}

/// GET on the route's health path; any 2xx is healthy
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(probe_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            timeout: probe_timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, route: &ServiceRoute) -> Result<(), ProbeError> {
        let url = route
            .health_check_url()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        match timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(ProbeError::BadStatus(response.status().as_u16())),
            Ok(Err(e)) if e.is_timeout() => Err(ProbeError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

/// Per-service entry of the readiness report
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReadiness {
    pub status: ServiceStatus,
    pub critical: bool,
}

/// Readiness decision with per-service detail
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// Critical services currently unhealthy
    pub failing: Vec<String>,
    pub services: BTreeMap<String, ServiceReadiness>,
}

struct ProbeTask {
    route: Arc<ServiceRoute>,
    cancel: CancellationToken,
}

/// Background health monitor
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    unhealthy_threshold: u32,
    health: DashMap<String, ServiceHealth>,
    tasks: Mutex<HashMap<String, ProbeTask>>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: &HealthMonitorConfig,
    ) -> Self {
        let health = DashMap::new();
        for route in registry.routes() {
            health.insert(route.name.clone(), ServiceHealth::unknown());
        }
        Self {
            registry,
            probe,
            unhealthy_threshold: config.unhealthy_threshold,
            health,
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Health of one service (`Unknown` if never seen)
    pub fn health(&self, name: &str) -> ServiceHealth {
        self.health
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Health of every registered service
    pub fn snapshot(&self) -> BTreeMap<String, ServiceHealth> {
        self.registry
            .routes()
            .into_iter()
            .map(|route| {
                let health = self.health(&route.name);
                (route.name.clone(), health)
            })
            .collect()
    }

    /// Ready unless a critical service is unhealthy
    pub fn readiness(&self) -> Readiness {
        let mut services = BTreeMap::new();
        let mut failing = Vec::new();

        for route in self.registry.routes() {
            let status = self.health(&route.name).status;
            if route.is_critical && status == ServiceStatus::Unhealthy {
                failing.push(route.name.clone());
            }
            services.insert(
                route.name.clone(),
                ServiceReadiness {
                    status,
                    critical: route.is_critical,
                },
            );
        }

        Readiness {
            ready: failing.is_empty(),
            failing,
            services,
        }
    }

    /// Apply a probe result
    pub fn record_probe(&self, name: &str, result: Result<(), ProbeError>) -> ServiceHealth {
        let now = Utc::now();
        let mut entry = self.health.entry(name.to_string()).or_default();
        let prev = entry.value().clone();
        let next = next_health(&prev, &result, self.unhealthy_threshold, now);

        if prev.status != next.status {
            match next.status {
                ServiceStatus::Healthy => info!(service = %name, "Service healthy"),
                ServiceStatus::Degraded => warn!(
                    service = %name,
                    error = next.last_error.as_deref().unwrap_or_default(),
                    "Service degraded"
                ),
                ServiceStatus::Unhealthy => warn!(
                    service = %name,
                    failures = next.consecutive_failures,
                    error = next.last_error.as_deref().unwrap_or_default(),
                    "Service unhealthy"
                ),
                ServiceStatus::Unknown => {}
            }
        }

        metrics::record_service_health(name, next.status.gauge_value());
        *entry.value_mut() = next.clone();
        next
    }

    /// Reflect a circuit breaker transition in the service's health
    pub fn observe_breaker(&self, name: &str, transition: BreakerTransition) {
        match transition {
            BreakerTransition::Opened => {
                let mut entry = self.health.entry(name.to_string()).or_default();
                let health = entry.value_mut();
                if health.status != ServiceStatus::Unhealthy {
                    health.status = ServiceStatus::Degraded;
                }
                health.last_error = Some("circuit open".to_string());
                metrics::record_service_health(name, health.status.gauge_value());
            }
            BreakerTransition::Closed => {
                self.record_probe(name, Ok(()));
            }
        }
    }

    /// Spawn probe tasks for every route and follow registry changes
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        for route in self.registry.routes() {
            self.spawn_probe(route);
        }

        let monitor = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RegistryEvent::RouteReplaced { current, .. }) => {
                            monitor.spawn_probe(current);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Health monitor lagged behind registry events, resyncing");
                            for route in monitor.registry.routes() {
                                monitor.spawn_probe(route);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Health monitor event loop stopped");
        })
    }

    /// Stop every probe task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, task) in self.tasks.lock().drain() {
            task.cancel.cancel();
        }
        info!("Health monitor stopped");
    }

    /// Record a probe result unless its task was replaced meanwhile.
    /// Holds the task table so a concurrent replacement cannot interleave.
    fn record_unless_cancelled(
        &self,
        name: &str,
        cancel: &CancellationToken,
        result: Result<(), ProbeError>,
    ) -> bool {
        let _tasks = self.tasks.lock();
        if cancel.is_cancelled() {
            return false;
        }
        self.record_probe(name, result);
        true
    }

    fn spawn_probe(self: &Arc<Self>, route: Arc<ServiceRoute>) {
        let cancel = self.shutdown.child_token();
        {
            let mut tasks = self.tasks.lock();
            let target_changed = match tasks.get(&route.name) {
                Some(existing) if Arc::ptr_eq(&existing.route, &route) => return,
                Some(existing) => {
                    existing.cancel.cancel();
                    existing.route.target != route.target
                        || existing.route.health_check_path != route.health_check_path
                }
                None => false,
            };
            // The old task is cancelled first so its last result cannot
            // overwrite the reset.
            if target_changed {
                self.health.insert(route.name.clone(), ServiceHealth::unknown());
            }
            tasks.insert(
                route.name.clone(),
                ProbeTask {
                    route: Arc::clone(&route),
                    cancel: cancel.clone(),
                },
            );
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(route.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = monitor.probe.probe(&route).await;
                        if !monitor.record_unless_cancelled(&route.name, &cancel, result) {
                            break;
                        }
                    }
                }
            }
            debug!(service = %route.name, "Probe task stopped");
        });
    }
}
