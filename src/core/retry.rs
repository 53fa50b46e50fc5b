//! Retry decisions for forwarded requests.
//!
//! [`RetryPolicy::decide`] is a pure function of the method, how many attempts
//! were already made and what kind of failure happened. It never sleeps; the
//! dispatcher owns the timer. Only connection failures and timeouts are
//! retried, and only for idempotent methods.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Randomize each delay into `[delay/2, delay]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Apply jitter to a computed delay when enabled
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        half + half.mul_f64(fastrand::f64())
    }
}

/// Classification of a failed forwarding attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection could not be established
    Connect,
    /// The attempt exceeded the request timeout
    Timeout,
    /// Anything after the connection was established (reset mid-body, decode errors)
    Other,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Per-route retry configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decide whether attempt number `attempts_made + 1` should happen
    pub fn decide(&self, method: &Method, attempts_made: u32, failure: FailureKind) -> RetryDecision {
        if !is_idempotent(method) {
            return RetryDecision::GiveUp;
        }
        if !matches!(failure, FailureKind::Connect | FailureKind::Timeout) {
            return RetryDecision::GiveUp;
        }
        if attempts_made == 0 || attempts_made > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay_for(attempts_made),
        }
    }
}

/// Methods whose repetition has the same effect as a single request
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}
