//! Circuit Breaker Implementation
//!
//! One breaker per service route, shielding backends that keep failing. The
//! breaker is a three-state machine:
//!
//! - **Closed**: requests pass through; consecutive failures are counted
//! - **Open**: requests fail fast with 503 and never reach the backend
//! - **HalfOpen**: exactly one probe request is in flight; its outcome decides
//!   whether the circuit closes again or reopens
//!
//! Transitions are the pure functions [`on_admit`] and [`on_outcome`]; the
//! [`CircuitBreaker`] only applies them under a `parking_lot::Mutex` and keeps
//! lock-free counters next to the state.
//!
//! Thresholds are not stored in the breaker. They are read from the
//! `ServiceRoute` captured by each request, so a route replacement takes effect
//! on the next admission without resetting the failure streak.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::error::GatewayError;
use crate::core::types::ServiceRoute;

/// Circuit breaker specific errors
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open for {service}")]
    CircuitOpen { service: String, retry_after: Duration },
}

impl From<CircuitBreakerError> for GatewayError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen {
                service,
                retry_after,
            } => GatewayError::CircuitBreakerOpen {
                service,
                retry_after_secs: ceil_secs(retry_after),
            },
        }
    }
}

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Normal operation, tracking the current failure streak
    Closed { consecutive_failures: u32 },

    /// Failing fast since `opened_at`
    Open { opened_at: Instant },

    /// The single recovery probe is in flight
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Thresholds applied to one admission, taken from the route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub probe_interval: Duration,
}

impl From<&ServiceRoute> for BreakerSettings {
    fn from(route: &ServiceRoute) -> Self {
        Self {
            failure_threshold: route.circuit_breaker_threshold,
            probe_interval: route.half_open_probe_interval,
        }
    }
}

/// Result of asking the breaker whether a request may go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed(BreakerPermit),
    Rejected { retry_after: Duration },
}

/// Proof of admission; the outcome must be reported against it exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPermit {
    /// This request is the half-open recovery probe
    pub probe: bool,
    pub failure_threshold: u32,
}

/// Outcome of a forwarded request as far as the breaker is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// State change caused by a recorded outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

/// Admission transition
pub fn on_admit(
    state: CircuitBreakerState,
    now: Instant,
    settings: BreakerSettings,
) -> (CircuitBreakerState, Admission) {
    let permit = |probe| BreakerPermit {
        probe,
        failure_threshold: settings.failure_threshold,
    };

    match state {
        CircuitBreakerState::Closed { .. } => (state, Admission::Allowed(permit(false))),
        CircuitBreakerState::Open { opened_at } => {
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed >= settings.probe_interval {
                (CircuitBreakerState::HalfOpen, Admission::Allowed(permit(true)))
            } else {
                (
                    state,
                    Admission::Rejected {
                        retry_after: settings.probe_interval - elapsed,
                    },
                )
            }
        }
        CircuitBreakerState::HalfOpen => (
            state,
            Admission::Rejected {
                retry_after: settings.probe_interval,
            },
        ),
    }
}

/// Outcome transition
///
/// Outcomes of requests admitted before the circuit opened are ignored once it
/// is open or half-open; only the probe can move a half-open breaker.
pub fn on_outcome(
    state: CircuitBreakerState,
    permit: BreakerPermit,
    outcome: Outcome,
    now: Instant,
) -> CircuitBreakerState {
    match (state, outcome) {
        (CircuitBreakerState::Closed { .. }, Outcome::Success) => {
            CircuitBreakerState::Closed {
                consecutive_failures: 0,
            }
        }
        (CircuitBreakerState::Closed { consecutive_failures }, Outcome::Failure) => {
            let failures = consecutive_failures.saturating_add(1);
            if failures >= permit.failure_threshold.max(1) {
                CircuitBreakerState::Open { opened_at: now }
            } else {
                CircuitBreakerState::Closed {
                    consecutive_failures: failures,
                }
            }
        }
        (CircuitBreakerState::HalfOpen, Outcome::Success) if permit.probe => {
            CircuitBreakerState::Closed {
                consecutive_failures: 0,
            }
        }
        (CircuitBreakerState::HalfOpen, Outcome::Failure) if permit.probe => {
            CircuitBreakerState::Open { opened_at: now }
        }
        (state, _) => state,
    }
}

/// Metrics collected by the circuit breaker
///
/// Uses atomic operations for lock-free updates from multiple threads
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    /// Requests rejected without contacting the backend
    pub rejected_requests: AtomicU64,
    pub circuit_opened_count: AtomicU64,
    pub circuit_closed_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
            circuit_closed_count: self.circuit_closed_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub circuit_opened_count: u64,
    pub circuit_closed_count: u64,
}

/// Admin view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    /// Seconds since the circuit opened, while open
    pub open_for_secs: Option<u64>,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

/// Per-route circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: Mutex<CircuitBreakerState>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CircuitBreakerState::Closed {
                consecutive_failures: 0,
            }),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    /// Ask to send one request to the backend
    pub fn admit(&self, settings: BreakerSettings) -> Result<BreakerPermit, CircuitBreakerError> {
        self.admit_at(settings, Instant::now())
    }

    pub fn admit_at(
        &self,
        settings: BreakerSettings,
        now: Instant,
    ) -> Result<BreakerPermit, CircuitBreakerError> {
        let admission = {
            let mut state = self.state.lock();
            let (next, admission) = on_admit(*state, now, settings);
            *state = next;
            admission
        };

        match admission {
            Admission::Allowed(permit) => {
                self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
                if permit.probe {
                    tracing::info!(service = %self.name, "Circuit half-open, admitting probe request");
                }
                Ok(permit)
            }
            Admission::Rejected { retry_after } => {
                self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::CircuitOpen {
                    service: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Record the outcome of an admitted request
    pub fn record(&self, permit: BreakerPermit, outcome: Outcome) -> Option<BreakerTransition> {
        self.record_at(permit, outcome, Instant::now())
    }

    pub fn record_at(
        &self,
        permit: BreakerPermit,
        outcome: Outcome,
        now: Instant,
    ) -> Option<BreakerTransition> {
        match outcome {
            Outcome::Success => self.metrics.successful_requests.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed),
        };

        let (before, after) = {
            let mut state = self.state.lock();
            let before = *state;
            *state = on_outcome(before, permit, outcome, now);
            (before, *state)
        };

        let transition = match (before, after) {
            (CircuitBreakerState::Open { .. }, _) => None,
            (_, CircuitBreakerState::Open { .. }) => Some(BreakerTransition::Opened),
            (CircuitBreakerState::HalfOpen, CircuitBreakerState::Closed { .. }) => {
                Some(BreakerTransition::Closed)
            }
            _ => None,
        };

        match transition {
            Some(BreakerTransition::Opened) => {
                self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(service = %self.name, "Circuit breaker opened");
            }
            Some(BreakerTransition::Closed) => {
                self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(service = %self.name, "Circuit breaker closed after successful probe");
            }
            None => {}
        }
        transition
    }

    /// Manually close the circuit (admin override)
    pub fn reset(&self) {
        *self.state.lock() = CircuitBreakerState::Closed {
            consecutive_failures: 0,
        };
        self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitBreakerState {
        *self.state.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.label(),
            consecutive_failures: match state {
                CircuitBreakerState::Closed {
                    consecutive_failures,
                } => consecutive_failures,
                _ => 0,
            },
            open_for_secs: match state {
                CircuitBreakerState::Open { opened_at } => Some(opened_at.elapsed().as_secs()),
                _ => None,
            },
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Circuit breaker registry, one breaker per service name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the breaker for a service
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
