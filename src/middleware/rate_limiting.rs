//! # Rate Limiting System
//!
//! Fixed-window quotas evaluated per request across up to four scopes:
//! client IP, user, tenant and (when an override exists for the route) the
//! endpoint. Each scope is an independent counter; the request is rejected
//! when any of them is over its limit.
//!
//! ## Architecture
//! - [`CounterStore`] abstracts the counter backend. [`InMemoryCounterStore`]
//!   keeps counters per process, [`RedisCounterStore`] shares them across
//!   gateway instances.
//! - Windows are aligned to the Unix epoch, so every instance agrees on where a
//!   window starts. The window index is part of the counter key; a new window
//!   is simply a new key and old keys expire on their own.
//! - Increment-then-compare: the store increments atomically and returns the
//!   new count, which makes concurrent requests unable to overshoot the limit.
//!
//! When the store cannot be reached the configured [`FailurePolicy`] decides
//! between admitting the request (fail-open) and rejecting it (fail-closed).

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::core::config::{CounterStoreConfig, FailurePolicy, RateLimitSettings};
use crate::core::error::GatewayError;
use crate::core::types::{RequestContext, ServiceRoute};
use crate::observability::metrics;

/// Extra lifetime for counter keys past the end of their window
const KEY_EXPIRY_SLACK: Duration = Duration::from_secs(5);

/// Sweep expired in-memory counters every this many increments
const SWEEP_EVERY: u64 = 4096;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {scope} scope")]
    Exceeded {
        scope: RateLimitScope,
        limit: u64,
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<RateLimitError> for GatewayError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded {
                scope,
                limit,
                retry_after,
                reset_at,
            } => GatewayError::RateLimitExceeded {
                scope: scope.to_string(),
                limit,
                retry_after_secs: retry_after.as_secs().max(1),
                reset_at,
            },
            other => GatewayError::service_unavailable("rate-limit-store", other.to_string()),
        }
    }
}

/// Which quota a counter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Ip,
    User,
    Tenant,
    Endpoint,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
            Self::Tenant => "tenant",
            Self::Endpoint => "endpoint",
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic counter backend
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count; a new key expires after `ttl`
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError>;

    /// Current count without incrementing (0 when absent)
    async fn peek(&self, key: &str) -> Result<u64, RateLimitError>;

    fn backend(&self) -> &'static str;
}

/// In-memory storage implementation
#[derive(Default)]
pub struct InMemoryCounterStore {
    data: DashMap<String, (u64, Instant)>,
    increments: AtomicU64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.data.retain(|_, (_, expiry)| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let expiry = now + ttl;

        // The entry guard holds the shard lock, so increment and read are atomic.
        let count = {
            let entry = self
                .data
                .entry(key.to_string())
                .and_modify(|(count, exp)| {
                    if *exp > now {
                        *count += 1;
                    } else {
                        *count = 1;
                        *exp = expiry;
                    }
                })
                .or_insert((1, expiry));
            entry.value().0
        };

        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.cleanup_expired();
        }
        Ok(count)
    }

    async fn peek(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self
            .data
            .get(key)
            .filter(|entry| entry.value().1 > Instant::now())
            .map(|entry| entry.value().0)
            .unwrap_or(0))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis storage implementation
///
/// The connection is established lazily on first use, so a gateway can start
/// while Redis is still down and rely on its failure policy until it comes up.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> Result<Self, RateLimitError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
        let manager = self
            .connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError> {
        let mut conn = self.connection().await?;
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn peek(&self, key: &str) -> Result<u64, RateLimitError> {
        let mut conn = self.connection().await?;
        let count: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(count.unwrap_or(0))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Quota left after an admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowance {
    /// Minimum remaining across the evaluated scopes
    pub remaining: u64,
    /// Reset of the scope with the least remaining
    pub reset_at: DateTime<Utc>,
}

/// Current usage of one scope, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ScopeUsage {
    pub scope: RateLimitScope,
    pub key: String,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// One scope to evaluate for a request
#[derive(Debug, Clone)]
struct ScopeCheck {
    scope: RateLimitScope,
    key: String,
    limit: u64,
    window: Duration,
}

/// Position of `now` inside a fixed, epoch-aligned window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowPosition {
    index: u64,
    reset_at_ms: u64,
    remaining_ms: u64,
}

fn window_position(now: SystemTime, window: Duration) -> WindowPosition {
    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let window_ms = (window.as_millis() as u64).max(1);
    let index = now_ms / window_ms;
    let reset_at_ms = (index + 1) * window_ms;
    WindowPosition {
        index,
        reset_at_ms,
        remaining_ms: reset_at_ms - now_ms,
    }
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Whole seconds until the window resets, never zero
fn retry_after(position: &WindowPosition) -> Duration {
    Duration::from_secs(position.remaining_ms.div_ceil(1000).max(1))
}

/// Main rate limiter implementation
pub struct RateLimiter {
    settings: ArcSwap<RateLimitSettings>,
    store: Arc<dyn CounterStore>,
    key_prefix: String,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, store: Arc<dyn CounterStore>) -> Self {
        let key_prefix = match &settings.store {
            CounterStoreConfig::Redis { key_prefix, .. } => key_prefix.clone(),
            CounterStoreConfig::Memory => "gateway:rl".to_string(),
        };
        Self {
            settings: ArcSwap::from_pointee(settings),
            store,
            key_prefix,
        }
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.load_full()
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Replace the limits at runtime; the counter store stays as configured
    pub fn update_settings(&self, mut settings: RateLimitSettings) -> Result<(), GatewayError> {
        settings.validate()?;
        settings.store = self.settings.load().store.clone();
        self.settings.store(Arc::new(settings));
        tracing::info!("Rate limit settings updated");
        Ok(())
    }

    /// Count this request against every applicable scope
    pub async fn check(
        &self,
        ctx: &RequestContext,
        route: &ServiceRoute,
    ) -> Result<Option<Allowance>, RateLimitError> {
        self.check_at(ctx, route, SystemTime::now()).await
    }

    pub async fn check_at(
        &self,
        ctx: &RequestContext,
        route: &ServiceRoute,
        now: SystemTime,
    ) -> Result<Option<Allowance>, RateLimitError> {
        let settings = self.settings.load_full();
        if !settings.enabled {
            return Ok(None);
        }

        let checks = self.scopes_for(&settings, ctx, &route.name);
        let store_timeout = settings.store_timeout;
        let results = join_all(checks.iter().map(|check| {
            let position = window_position(now, check.window);
            let key = self.counter_key(check, position.index);
            let ttl = check.window + KEY_EXPIRY_SLACK;
            async move {
                let counted = tokio::time::timeout(
                    store_timeout,
                    self.store.increment_and_get(&key, ttl),
                )
                .await
                .unwrap_or_else(|_| Err(RateLimitError::StoreUnavailable("store call timed out".to_string())));
                (position, counted)
            }
        }))
        .await;

        let mut exceeded: Option<(&ScopeCheck, WindowPosition)> = None;
        let mut allowance: Option<Allowance> = None;
        let mut store_error: Option<RateLimitError> = None;

        for (check, (position, counted)) in checks.iter().zip(results) {
            let count = match counted {
                Ok(count) => count,
                Err(e) => {
                    store_error.get_or_insert(e);
                    continue;
                }
            };

            if count > check.limit {
                metrics::record_rate_limited(check.scope.as_str());
                // Largest retry-after among exceeded scopes wins.
                let stricter = exceeded
                    .as_ref()
                    .map_or(true, |(_, current)| position.remaining_ms > current.remaining_ms);
                if stricter {
                    exceeded = Some((check, position));
                }
                continue;
            }

            let remaining = check.limit - count;
            if allowance.map_or(true, |a| remaining < a.remaining) {
                allowance = Some(Allowance {
                    remaining,
                    reset_at: millis_to_datetime(position.reset_at_ms),
                });
            }
        }

        if let Some((check, position)) = exceeded {
            debug!(
                scope = %check.scope,
                key = %check.key,
                limit = check.limit,
                "Rate limit exceeded"
            );
            return Err(RateLimitError::Exceeded {
                scope: check.scope,
                limit: check.limit,
                retry_after: retry_after(&position),
                reset_at: millis_to_datetime(position.reset_at_ms),
            });
        }

        if let Some(e) = store_error {
            return match settings.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(
                        error = %e,
                        backend = self.store.backend(),
                        "Counter store unavailable, admitting request (fail-open)"
                    );
                    Ok(allowance)
                }
                FailurePolicy::FailClosed => {
                    warn!(
                        error = %e,
                        backend = self.store.backend(),
                        "Counter store unavailable, rejecting request (fail-closed)"
                    );
                    Err(RateLimitError::StoreUnavailable(e.to_string()))
                }
            };
        }

        Ok(allowance)
    }

    /// Current-window usage for the given identities, without counting
    pub async fn status(
        &self,
        user_id: Option<&str>,
        tenant_id: Option<&str>,
        ip: Option<&str>,
    ) -> Result<Vec<ScopeUsage>, RateLimitError> {
        let settings = self.settings.load_full();
        let now = SystemTime::now();

        let checks = [
            ip.map(|k| (RateLimitScope::Ip, k, settings.per_ip)),
            user_id.map(|k| (RateLimitScope::User, k, settings.per_user)),
            tenant_id.map(|k| (RateLimitScope::Tenant, k, settings.per_tenant)),
        ];

        let mut usage = Vec::new();
        for (scope, key, limit) in checks.into_iter().flatten() {
            let check = ScopeCheck {
                scope,
                key: key.to_string(),
                limit,
                window: settings.window,
            };
            let position = window_position(now, check.window);
            let count = self.store.peek(&self.counter_key(&check, position.index)).await?;
            usage.push(ScopeUsage {
                scope,
                key: check.key,
                count,
                limit,
                remaining: limit.saturating_sub(count),
                reset_at: millis_to_datetime(position.reset_at_ms),
            });
        }
        Ok(usage)
    }

    fn scopes_for(
        &self,
        settings: &RateLimitSettings,
        ctx: &RequestContext,
        route_name: &str,
    ) -> Vec<ScopeCheck> {
        let ip = ctx.client_ip_string();
        let mut checks = vec![ScopeCheck {
            scope: RateLimitScope::Ip,
            key: ip.clone(),
            limit: settings.per_ip,
            window: settings.window,
        }];

        if let Some(user_id) = &ctx.user_id {
            checks.push(ScopeCheck {
                scope: RateLimitScope::User,
                key: user_id.clone(),
                limit: settings.per_user,
                window: settings.window,
            });
        }
        if let Some(tenant_id) = &ctx.tenant_id {
            checks.push(ScopeCheck {
                scope: RateLimitScope::Tenant,
                key: tenant_id.clone(),
                limit: settings.per_tenant,
                window: settings.window,
            });
        }
        if let Some(rule) = settings.endpoint_overrides.get(route_name) {
            let caller = ctx.user_id.clone().unwrap_or(ip);
            checks.push(ScopeCheck {
                scope: RateLimitScope::Endpoint,
                key: format!("{}:{}", route_name, caller),
                limit: rule.limit,
                window: rule.window.unwrap_or(settings.window),
            });
        }
        checks
    }

    fn counter_key(&self, check: &ScopeCheck, window_index: u64) -> String {
        format!(
            "{}:{}:{}:{}",
            self.key_prefix, check.scope, check.key, window_index
        )
    }
}
