//! Signing-key sources and the process-wide key cache.
//!
//! A [`KeySource`] produces the key tokens are verified with: either static
//! material from configuration or a PEM document fetched over HTTP. The
//! [`SigningKeyCache`] sits in front of it and keeps the last key that was
//! fetched successfully, so a key server outage degrades into "verify with the
//! last known-good key" instead of rejecting every request.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// A forced refresh is skipped when the cached key is younger than this,
/// so a stream of badly signed tokens cannot hammer the key server.
pub const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone)]
pub enum KeySourceError {
    #[error("key source unreachable: {0}")]
    Unreachable(String),

    #[error("key source answered with status {0}")]
    BadStatus(u16),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("no signing key has ever been fetched")]
    Unavailable,
}

impl From<KeySourceError> for GatewayError {
    fn from(err: KeySourceError) -> Self {
        match err {
            KeySourceError::InvalidKey(message) => GatewayError::config(message),
            other => GatewayError::service_unavailable("key-source", other.to_string()),
        }
    }
}

/// Where verification keys come from
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_key(&self) -> Result<DecodingKey, KeySourceError>;

    /// Short description for status output
    fn describe(&self) -> String;
}

/// Key material taken from configuration
pub struct StaticKeySource {
    key: DecodingKey,
    kind: &'static str,
}

impl StaticKeySource {
    /// Shared secret for HS256/384/512
    pub fn hmac(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            kind: "static hmac secret",
        }
    }

    /// PEM-encoded public key for an asymmetric algorithm
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self, KeySourceError> {
        Ok(Self {
            key: decoding_key_from_pem(algorithm, pem)?,
            kind: "static public key",
        })
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch_key(&self) -> Result<DecodingKey, KeySourceError> {
        Ok(self.key.clone())
    }

    fn describe(&self) -> String {
        self.kind.to_string()
    }
}

/// Fetches a PEM public key with a plain GET
pub struct HttpKeySource {
    client: reqwest::Client,
    url: Url,
    algorithm: Algorithm,
}

impl HttpKeySource {
    pub fn new(url: Url, algorithm: Algorithm) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(KEY_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url,
            algorithm,
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch_key(&self) -> Result<DecodingKey, KeySourceError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| KeySourceError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeySourceError::BadStatus(response.status().as_u16()));
        }

        let pem = response
            .bytes()
            .await
            .map_err(|e| KeySourceError::Unreachable(e.to_string()))?;
        decoding_key_from_pem(self.algorithm, &pem)
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

fn decoding_key_from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<DecodingKey, KeySourceError> {
    let key = match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            return Err(KeySourceError::InvalidKey(format!(
                "{:?} uses a shared secret, not a PEM key",
                algorithm
            )))
        }
    };
    key.map_err(|e| KeySourceError::InvalidKey(e.to_string()))
}

/// Build the configured key source
pub fn key_source_from_config(auth: &AuthConfig) -> GatewayResult<Arc<dyn KeySource>> {
    if let Some(url) = &auth.public_key_url {
        return Ok(Arc::new(HttpKeySource::new(url.clone(), auth.algorithm)?));
    }
    if auth.uses_shared_secret() {
        let secret = auth
            .secret
            .as_deref()
            .ok_or_else(|| GatewayError::config("auth.secret is not set"))?;
        return Ok(Arc::new(StaticKeySource::hmac(secret.as_bytes())));
    }
    let pem = auth
        .public_key_pem
        .as_deref()
        .ok_or_else(|| GatewayError::config("auth.public_key_pem is not set"))?;
    Ok(Arc::new(StaticKeySource::from_pem(auth.algorithm, pem.as_bytes())?))
}

/// A key handed out by the cache
#[derive(Clone)]
pub struct KeyLease {
    pub key: DecodingKey,
    pub fetched_at: Instant,
}

/// Key cache state for admin status output
#[derive(Debug, Clone, Serialize)]
pub struct KeyCacheStatus {
    pub source: String,
    pub key_loaded: bool,
    pub key_age_secs: Option<u64>,
    /// Serving a stale key because refreshing failed
    pub degraded: bool,
    pub last_error: Option<String>,
    /// Seconds until the next refresh attempt while degraded
    pub retry_in_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyCacheSettings {
    pub ttl: Duration,
    pub refresh_attempts: u32,
    pub refresh_backoff: Duration,
    /// After a refresh fails outright, the stale key is served without
    /// contacting the source until this much time has passed.
    pub failed_refresh_retry: Duration,
    pub min_forced_refresh: Duration,
}

impl Default for KeyCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_attempts: 3,
            refresh_backoff: Duration::from_millis(100),
            failed_refresh_retry: Duration::from_secs(30),
            min_forced_refresh: MIN_FORCED_REFRESH_INTERVAL,
        }
    }
}

impl From<&AuthConfig> for KeyCacheSettings {
    fn from(auth: &AuthConfig) -> Self {
        Self {
            ttl: auth.key_cache_ttl,
            refresh_attempts: auth.key_refresh_attempts,
            refresh_backoff: auth.key_refresh_backoff,
            failed_refresh_retry: auth.key_refresh_retry_interval,
            ..Self::default()
        }
    }
}

/// Process-wide signing-key cache
pub struct SigningKeyCache {
    source: Arc<dyn KeySource>,
    settings: KeyCacheSettings,
    current: RwLock<Option<KeyLease>>,
    degraded: AtomicBool,
    last_error: RwLock<Option<String>>,
    /// When the last refresh ran out of attempts
    last_failure: RwLock<Option<Instant>>,
    /// One refresh at a time; waiters reuse its result
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SigningKeyCache {
    pub fn new(source: Arc<dyn KeySource>, settings: KeyCacheSettings) -> Self {
        Self {
            source,
            settings,
            current: RwLock::new(None),
            degraded: AtomicBool::new(false),
            last_error: RwLock::new(None),
            last_failure: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Key to verify with, refreshing synchronously when the TTL has expired
    pub async fn current_key(&self) -> Result<KeyLease, KeySourceError> {
        if let Some(lease) = self.cached_within(self.settings.ttl) {
            return Ok(lease);
        }
        self.refresh(false).await
    }

    /// Refresh regardless of TTL, used after a signature failure
    pub async fn force_refresh(&self) -> Result<KeyLease, KeySourceError> {
        self.refresh(true).await
    }

    /// Whether a forced refresh could still yield a newer key than `lease`
    pub fn can_force_refresh(&self, lease: &KeyLease) -> bool {
        lease.fetched_at.elapsed() >= self.settings.min_forced_refresh
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> KeyCacheStatus {
        let current = self.current.read();
        KeyCacheStatus {
            source: self.source.describe(),
            key_loaded: current.is_some(),
            key_age_secs: current.as_ref().map(|l| l.fetched_at.elapsed().as_secs()),
            degraded: self.is_degraded(),
            last_error: self.last_error.read().clone(),
            retry_in_secs: self.retry_pending().map(|left| left.as_secs()),
        }
    }

    /// Time left before a failed refresh may be retried
    fn retry_pending(&self) -> Option<Duration> {
        let failed_at = (*self.last_failure.read())?;
        self.settings
            .failed_refresh_retry
            .checked_sub(failed_at.elapsed())
            .filter(|left| !left.is_zero())
    }

    fn cached_within(&self, max_age: Duration) -> Option<KeyLease> {
        self.current
            .read()
            .as_ref()
            .filter(|lease| lease.fetched_at.elapsed() < max_age)
            .cloned()
    }

    /// Outcome served without touching the source after a failed refresh
    fn while_cooling_down(&self) -> Option<Result<KeyLease, KeySourceError>> {
        self.retry_pending()?;
        Some(self.current.read().clone().ok_or(KeySourceError::Unavailable))
    }

    async fn refresh(&self, force: bool) -> Result<KeyLease, KeySourceError> {
        if let Some(outcome) = self.while_cooling_down() {
            return outcome;
        }
        let stale = self.current.read().clone();
        let _guard = match stale {
            // A refresh is already running: keep serving the stale key.
            Some(lease) if !force => match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(lease),
            },
            _ => self.refresh_lock.lock().await,
        };

        // Another task may have refreshed while this one waited for the lock.
        let reuse_within = if force {
            self.settings.min_forced_refresh
        } else {
            self.settings.ttl
        };
        if let Some(lease) = self.cached_within(reuse_within) {
            return Ok(lease);
        }
        if let Some(outcome) = self.while_cooling_down() {
            return outcome;
        }

        let attempts = self.settings.refresh_attempts.max(1);
        for attempt in 1..=attempts {
            match self.source.fetch_key().await {
                Ok(key) => {
                    let lease = KeyLease {
                        key,
                        fetched_at: Instant::now(),
                    };
                    *self.current.write() = Some(lease.clone());
                    *self.last_error.write() = None;
                    *self.last_failure.write() = None;
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!(source = %self.source.describe(), "Signing key source recovered");
                    } else {
                        debug!(source = %self.source.describe(), forced = force, "Signing key refreshed");
                    }
                    return Ok(lease);
                }
                Err(e) => {
                    warn!(
                        source = %self.source.describe(),
                        attempt,
                        attempts,
                        error = %e,
                        "Signing key refresh failed"
                    );
                    *self.last_error.write() = Some(e.to_string());
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.refresh_backoff).await;
                    }
                }
            }
        }

        *self.last_failure.write() = Some(Instant::now());
        let fallback = self.current.read().clone();
        match fallback {
            Some(lease) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        source = %self.source.describe(),
                        "Using last known-good signing key; key source degraded"
                    );
                }
                Ok(lease)
            }
            None => Err(KeySourceError::Unavailable),
        }
    }
}
