//! # Configuration Module
//!
//! Startup configuration for the gateway: server settings, token verification,
//! rate-limit defaults, the initial service table, health probing and
//! observability.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde (chosen by file extension)
//! - Human-readable durations (`"30s"`, `"2m"`) via `humantime_serde`
//! - Environment variable overrides (`GATEWAY_*`)
//! - Validation that reports every problem at once instead of the first one
//!
//! Runtime changes (route replacement, rate-limit updates) do not go through
//! this module; they are applied to the live registry and limiter by the admin
//! endpoints.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::retry::BackoffPolicy;
use crate::core::types::ServiceRoute;
use crate::routing::registry::RouteTable;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and HTTP surface settings
    pub server: ServerConfig,

    /// Token verification and admin gating
    pub auth: AuthConfig,

    /// Default quotas and the counter store
    pub rate_limiting: RateLimitSettings,

    /// Initial service table, keyed by service name
    pub services: BTreeMap<String, ServiceDefinition>,

    /// Background health probing
    pub health: HealthMonitorConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML or JSON file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config: GatewayConfig = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without touching the environment
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern `GATEWAY_<SECTION>_<FIELD>`,
    /// for example `GATEWAY_SERVER_PORT=8080`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(port) = env::var("GATEWAY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_PORT: {}", e)))?;
        }

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.secret = Some(secret);
        }

        if let Ok(url) = env::var("GATEWAY_JWT_PUBLIC_KEY_URL") {
            self.auth.public_key_url = Some(
                Url::parse(&url)
                    .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_JWT_PUBLIC_KEY_URL: {}", e)))?,
            );
        }

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            let key_prefix = match &self.rate_limiting.store {
                CounterStoreConfig::Redis { key_prefix, .. } => key_prefix.clone(),
                CounterStoreConfig::Memory => default_key_prefix(),
            };
            self.rate_limiting.store = CounterStoreConfig::Redis { url, key_prefix };
        }

        if let Ok(policy) = env::var("GATEWAY_RATE_LIMIT_FAILURE_POLICY") {
            self.rate_limiting.failure_policy = policy.parse()?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format.parse()?;
        }

        if let Ok(enabled) = env::var("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.prometheus_enabled = enabled
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.max_request_body_size == 0 {
            errors.push("server.max_request_body_size must be greater than 0".to_string());
        }

        self.auth.collect_errors(&mut errors);
        self.rate_limiting.collect_errors(&mut errors);

        if self.health.unhealthy_threshold == 0 {
            errors.push("health.unhealthy_threshold must be greater than 0".to_string());
        }
        if self.health.probe_timeout.is_zero() {
            errors.push("health.probe_timeout must be greater than 0".to_string());
        }

        for (name, service) in &self.services {
            service.collect_errors(name, &mut errors);
        }

        // Prefix conflicts are only meaningful once every prefix parsed cleanly.
        if errors.is_empty() {
            let table = self
                .service_routes()
                .and_then(|routes| RouteTable::from_routes(routes).map_err(GatewayError::from));
            if let Err(e) = table {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Build the initial route table entries from the `services` section
    pub fn service_routes(&self) -> GatewayResult<Vec<ServiceRoute>> {
        self.services
            .iter()
            .map(|(name, definition)| ServiceRoute::from_definition(name, definition))
            .collect()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the listener
    pub bind_address: String,

    /// Listener port
    pub port: u16,

    /// Maximum accepted request body in bytes
    pub max_request_body_size: usize,

    /// How long in-flight requests get to finish on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Add the standard security headers to every response
    pub security_headers: bool,

    /// CORS settings
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            max_request_body_size: 10 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(30),
            security_headers: true,
            cors: CorsConfig::default(),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// `*` allows any origin
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    /// `*` allows any header
    pub allowed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec!["*".to_string()],
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected signing algorithm
    pub algorithm: Algorithm,

    /// Shared secret for HMAC algorithms
    #[serde(skip_serializing)]
    pub secret: Option<String>,

    /// Inline PEM public key for RSA/EC algorithms
    pub public_key_pem: Option<String>,

    /// URL returning a PEM public key; takes precedence over inline material
    pub public_key_url: Option<Url>,

    /// How long a fetched key is trusted before a refresh is attempted
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,

    /// Attempts per refresh before falling back to the last known-good key
    pub key_refresh_attempts: u32,

    /// Delay between refresh attempts
    #[serde(with = "humantime_serde")]
    pub key_refresh_backoff: Duration,

    /// After every attempt of a refresh fails, the last known-good key is
    /// served without contacting the key source for this long
    #[serde(with = "humantime_serde")]
    pub key_refresh_retry_interval: Duration,

    /// Clock skew tolerated on `exp` and `iat`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,

    /// Paths that skip authentication; a trailing `*` matches by prefix
    pub public_paths: Vec<String>,

    /// Role required on admin routes
    pub admin_role: String,

    /// Authorization service consulted when the token lacks the admin role
    pub authz_service_url: Option<Url>,

    /// Timeout for authorization service calls
    #[serde(with = "humantime_serde")]
    pub authz_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            secret: None,
            public_key_pem: None,
            public_key_url: None,
            key_cache_ttl: Duration::from_secs(300),
            key_refresh_attempts: 3,
            key_refresh_backoff: Duration::from_millis(100),
            key_refresh_retry_interval: Duration::from_secs(30),
            leeway: Duration::from_secs(30),
            public_paths: [
                "/health",
                "/healthz",
                "/ready",
                "/metrics",
                "/docs",
                "/redoc",
                "/openapi.json",
                "/api/v1/discovery",
                "/api/v1/auth/login",
                "/api/v1/auth/register",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            admin_role: "admin".to_string(),
            authz_service_url: None,
            authz_timeout: Duration::from_secs(2),
        }
    }
}

impl AuthConfig {
    /// Whether the algorithm verifies with a shared secret
    pub fn uses_shared_secret(&self) -> bool {
        matches!(
            self.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        )
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.uses_shared_secret() {
            if self.secret.as_deref().map_or(true, str::is_empty) {
                errors.push(format!("auth.secret is required for {:?}", self.algorithm));
            }
        } else if self.public_key_pem.is_none() && self.public_key_url.is_none() {
            errors.push(format!(
                "auth.public_key_pem or auth.public_key_url is required for {:?}",
                self.algorithm
            ));
        }
        if self.key_cache_ttl.is_zero() {
            errors.push("auth.key_cache_ttl must be greater than 0".to_string());
        }
        if self.key_refresh_attempts == 0 {
            errors.push("auth.key_refresh_attempts must be at least 1".to_string());
        }
        if self.admin_role.is_empty() {
            errors.push("auth.admin_role cannot be empty".to_string());
        }
    }
}

/// What to do when the counter store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request and log the store failure
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(GatewayError::config(format!(
                "Invalid rate limit failure policy: {}",
                other
            ))),
        }
    }
}

/// Counter store backing the rate limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterStoreConfig {
    /// Process-local counters; limits are per instance
    #[default]
    Memory,
    /// Shared Redis counters; limits hold across instances
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "gateway:rl".to_string()
}

/// A per-route quota that applies on top of the global scopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub limit: u64,
    /// Falls back to the global window when absent
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
}

/// Rate-limit configuration; replaceable at runtime through the admin API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,

    /// Fixed window length shared by the ip/user/tenant scopes
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    pub per_ip: u64,
    pub per_user: u64,
    pub per_tenant: u64,

    /// Endpoint overrides keyed by service (route) name
    pub endpoint_overrides: BTreeMap<String, EndpointLimit>,

    pub failure_policy: FailurePolicy,

    /// Upper bound on one counter-store round trip
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    #[serde(skip_serializing)]
    pub store: CounterStoreConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            per_ip: 10_000,
            per_user: 1_000,
            per_tenant: 100_000,
            endpoint_overrides: BTreeMap::new(),
            failure_policy: FailurePolicy::FailOpen,
            store_timeout: Duration::from_millis(100),
            store: CounterStoreConfig::Memory,
        }
    }
}

impl RateLimitSettings {
    /// Validate a settings value, used both at startup and by the admin API
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::validation("rate_limiting", errors.join("; ")))
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.window.is_zero() {
            errors.push("rate_limiting.window must be greater than 0".to_string());
        }
        if self.enabled && (self.per_ip == 0 || self.per_user == 0 || self.per_tenant == 0) {
            errors.push("rate_limiting per_ip/per_user/per_tenant must be greater than 0".to_string());
        }
        for (name, rule) in &self.endpoint_overrides {
            if rule.limit == 0 {
                errors.push(format!("rate_limiting.endpoint_overrides.{}.limit must be greater than 0", name));
            }
            if rule.window.map_or(false, |w| w.is_zero()) {
                errors.push(format!("rate_limiting.endpoint_overrides.{}.window must be greater than 0", name));
            }
        }
        if self.store_timeout.is_zero() {
            errors.push("rate_limiting.store_timeout must be greater than 0".to_string());
        }
        if let CounterStoreConfig::Redis { url, .. } = &self.store {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                errors.push(format!("rate_limiting.store.url is not a redis URL: {}", url));
            }
        }
    }
}

/// One backend service as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Base URL of the service (scheme, host, port)
    pub url: Url,

    /// Path prefix owned by this service
    pub path_prefix: String,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_backoff: BackoffPolicy,

    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_half_open_probe_interval", with = "humantime_serde")]
    pub half_open_probe_interval: Duration,

    /// Unhealthy critical services fail readiness
    #[serde(default = "default_critical")]
    pub critical: bool,
}

impl ServiceDefinition {
    /// Validate one definition on its own, as submitted at runtime
    pub fn validate(&self, name: &str) -> GatewayResult<()> {
        let mut errors = Vec::new();
        self.collect_errors(name, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::validation(name, errors.join("; ")))
        }
    }

    fn collect_errors(&self, name: &str, errors: &mut Vec<String>) {
        if !matches!(self.url.scheme(), "http" | "https") {
            errors.push(format!("services.{}.url must use http or https", name));
        }
        if !self.path_prefix.starts_with('/') {
            errors.push(format!("services.{}.path_prefix must start with '/'", name));
        }
        if !self.health_check_path.starts_with('/') {
            errors.push(format!("services.{}.health_check_path must start with '/'", name));
        }
        if self.health_check_interval.is_zero() {
            errors.push(format!("services.{}.health_check_interval must be greater than 0", name));
        }
        if self.request_timeout.is_zero() {
            errors.push(format!("services.{}.request_timeout must be greater than 0", name));
        }
        if self.circuit_breaker_threshold == 0 {
            errors.push(format!("services.{}.circuit_breaker_threshold must be at least 1", name));
        }
        if self.half_open_probe_interval.is_zero() {
            errors.push(format!("services.{}.half_open_probe_interval must be greater than 0", name));
        }
        if self.retry_backoff.multiplier < 1.0 {
            errors.push(format!("services.{}.retry_backoff.multiplier must be >= 1.0", name));
        }
    }
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_half_open_probe_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_critical() -> bool {
    true
}

/// Background health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    /// Consecutive probe failures before a service is unhealthy
    pub unhealthy_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unhealthy_threshold: 3,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(GatewayError::config(format!("Invalid log format: {}", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the gateway's own target; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub prometheus_enabled: bool,
    pub endpoint_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            endpoint_path: "/metrics".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
server:
  port: 9080
  bind_address: "127.0.0.1"
auth:
  secret: "test-secret"
rate_limiting:
  window: "30s"
  per_user: 5
  endpoint_overrides:
    loan-service:
      limit: 2
services:
  loan-service:
    url: "http://127.0.0.1:8005"
    path_prefix: "/api/v1/loans"
    request_timeout: "2s"
    circuit_breaker_threshold: 3
  document-service:
    url: "http://127.0.0.1:8003"
    path_prefix: "/api/v1/documents"
    critical: false
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9080);
        assert_eq!(config.server.max_request_body_size, 10 * 1024 * 1024);
        assert_eq!(config.rate_limiting.window, Duration::from_secs(30));
        assert_eq!(config.rate_limiting.per_user, 5);
        assert_eq!(config.rate_limiting.per_tenant, 100_000);
        assert_eq!(config.rate_limiting.endpoint_overrides["loan-service"].limit, 2);

        let loans = &config.services["loan-service"];
        assert_eq!(loans.request_timeout, Duration::from_secs(2));
        assert_eq!(loans.health_check_path, "/health");
        assert_eq!(loans.max_retries, 3);
        assert!(loans.critical);
        assert!(!config.services["document-service"].critical);
    }

    #[test]
    fn test_default_config_requires_key_material() {
        let err = GatewayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("auth.secret"));

        let mut config = GatewayConfig::default();
        config.auth.secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
auth:
  algorithm: RS256
services:
  bad:
    url: "ftp://example.com"
    path_prefix: "api"
    circuit_breaker_threshold: 0
"#;
        let err = GatewayConfig::from_yaml_str(yaml).unwrap_err().to_string();
        assert!(err.contains("public_key_pem"));
        assert!(err.contains("http or https"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("circuit_breaker_threshold"));
    }

    #[test]
    fn test_duplicate_prefixes_are_rejected() {
        let yaml = r#"
auth:
  secret: "x"
services:
  a:
    url: "http://127.0.0.1:1"
    path_prefix: "/api/v1/loans"
  b:
    url: "http://127.0.0.1:2"
    path_prefix: "/api/v1//loans/"
"#;
        let err = GatewayConfig::from_yaml_str(yaml).unwrap_err().to_string();
        assert!(err.contains("/api/v1/loans"), "{}", err);
    }

    #[tokio::test]
    async fn test_load_from_file_with_env_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");
        tokio::fs::write(&config_path, SAMPLE).await.unwrap();

        env::set_var("GATEWAY_RATE_LIMIT_FAILURE_POLICY", "fail_closed");
        env::set_var("GATEWAY_LOG_FORMAT", "text");
        let config = GatewayConfig::load_from_file(&config_path).await;
        env::remove_var("GATEWAY_RATE_LIMIT_FAILURE_POLICY");
        env::remove_var("GATEWAY_LOG_FORMAT");

        let config = config.unwrap();
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.observability.logging.format, LogFormat::Text);
    }

    #[tokio::test]
    async fn test_load_json_by_extension() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.json");
        let json = r#"{"auth": {"secret": "abc"}, "server": {"port": 7000}}"#;
        tokio::fs::write(&config_path, json).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("fail_open".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailOpen);
        assert_eq!("CLOSED".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailClosed);
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }
}
