//! Bearer token validation and identity extraction.

use axum::http::{header, HeaderMap};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::keys::{KeySourceError, SigningKeyCache};
use crate::core::error::GatewayError;

/// Identity carried by a validated token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub user_id: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub exp: u64,
    pub iat: Option<u64>,
}

/// Claims as they appear on the wire
#[derive(Debug, Deserialize)]
struct RawClaims {
    user_id: Option<String>,
    sub: Option<String>,
    tenant_id: Option<String>,
    roles: Option<RolesClaim>,
    exp: u64,
    iat: Option<u64>,
}

/// `roles` may be a single string or a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RolesClaim {
    One(String),
    Many(Vec<String>),
}

impl TryFrom<RawClaims> for Claims {
    type Error = AuthError;

    fn try_from(raw: RawClaims) -> Result<Self, Self::Error> {
        let user_id = raw
            .user_id
            .or(raw.sub)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::invalid("missing user_id claim"))?;
        let tenant_id = raw
            .tenant_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::invalid("missing tenant_id claim"))?;
        let roles = match raw.roles {
            Some(RolesClaim::One(role)) => vec![role],
            Some(RolesClaim::Many(roles)) => roles,
            None => return Err(AuthError::invalid("missing roles claim")),
        };

        Ok(Self {
            user_id,
            tenant_id,
            roles,
            exp: raw.exp,
            iat: raw.iat,
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("signing key unavailable: {0}")]
    KeyUnavailable(#[from] KeySourceError),
}

impl AuthError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::KeyUnavailable(e) => e.into(),
            other => GatewayError::auth(other.to_string()),
        }
    }
}

/// Pull the token out of `Authorization: Bearer <token>`
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Missing)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Verifies tokens against the cached signing key
pub struct ClaimsValidator {
    keys: Arc<SigningKeyCache>,
    validation: Validation,
    leeway_secs: u64,
}

impl ClaimsValidator {
    pub fn new(keys: Arc<SigningKeyCache>, algorithm: Algorithm, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            keys,
            validation,
            leeway_secs,
        }
    }

    pub fn keys(&self) -> &Arc<SigningKeyCache> {
        &self.keys
    }

    /// Validate a bearer token and return its identity claims
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let lease = self.keys.current_key().await?;

        let raw = match self.decode(token, &lease.key) {
            Err(e)
                if matches!(e.kind(), ErrorKind::InvalidSignature)
                    && self.keys.can_force_refresh(&lease) =>
            {
                // Possibly rotated: one forced refresh, one re-verify.
                debug!("Signature check failed with an older key, forcing key refresh");
                let refreshed = self.keys.force_refresh().await?;
                self.decode(token, &refreshed.key).map_err(rejection)?
            }
            other => other.map_err(rejection)?,
        };

        let claims = Claims::try_from(raw)?;
        self.check_issued_at(&claims)?;
        Ok(claims)
    }

    fn decode(&self, token: &str, key: &DecodingKey) -> Result<RawClaims, JwtError> {
        jsonwebtoken::decode::<RawClaims>(token, key, &self.validation).map(|data| data.claims)
    }

    fn check_issued_at(&self, claims: &Claims) -> Result<(), AuthError> {
        let Some(iat) = claims.iat else {
            return Ok(());
        };
        let now = jsonwebtoken::get_current_timestamp();
        if iat > now.saturating_add(self.leeway_secs) {
            return Err(AuthError::invalid("token issued in the future"));
        }
        Ok(())
    }
}

fn rejection(e: JwtError) -> AuthError {
    let reason = match e.kind() {
        ErrorKind::InvalidSignature => "invalid signature",
        ErrorKind::ExpiredSignature => "token expired",
        ErrorKind::InvalidAlgorithm => "unexpected signing algorithm",
        ErrorKind::MissingRequiredClaim(_) => "missing exp claim",
        _ => "malformed token",
    };
    warn!(error = %e, "JWT validation failed");
    AuthError::invalid(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::{KeyCacheSettings, KeySource, StaticKeySource};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
    use serde_json::json;
    use std::time::Duration;

    const SECRET: &[u8] = b"unit-test-secret";
    const ROTATED_SECRET: &[u8] = b"unit-test-secret-rotated";

    fn validator() -> ClaimsValidator {
        let source: Arc<dyn KeySource> = Arc::new(StaticKeySource::hmac(SECRET));
        let cache = SigningKeyCache::new(
            source,
            KeyCacheSettings {
                ttl: Duration::from_secs(300),
                refresh_attempts: 1,
                refresh_backoff: Duration::from_millis(1),
                ..KeyCacheSettings::default()
            },
        );
        ClaimsValidator::new(Arc::new(cache), Algorithm::HS256, 30)
    }

    /// Serves the old secret on the first fetch and the new one afterwards
    struct RotatingSource {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl KeySource for RotatingSource {
        async fn fetch_key(&self) -> Result<DecodingKey, KeySourceError> {
            let secret: &[u8] = if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                SECRET
            } else {
                ROTATED_SECRET
            };
            Ok(DecodingKey::from_secret(secret))
        }

        fn describe(&self) -> String {
            "rotating".to_string()
        }
    }

    fn rotating_validator(min_forced_refresh: Duration) -> (ClaimsValidator, Arc<RotatingSource>) {
        let source = Arc::new(RotatingSource {
            fetches: AtomicU32::new(0),
        });
        let cache = SigningKeyCache::new(
            source.clone(),
            KeyCacheSettings {
                ttl: Duration::from_secs(300),
                min_forced_refresh,
                ..KeyCacheSettings::default()
            },
        );
        (
            ClaimsValidator::new(Arc::new(cache), Algorithm::HS256, 30),
            source,
        )
    }

    fn token(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_yields_claims() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-1", "tenant_id": "t-1", "roles": ["admin"], "exp": now + 600, "iat": now}),
            SECRET,
        );
        let claims = validator().validate(&jwt).await.unwrap();
        assert_eq!(claims.user_id, "u-1");
        assert_eq!(claims.roles, vec!["admin"]);
    }

    #[tokio::test]
    async fn test_sub_fallback_and_single_role_string() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"sub": "u-2", "tenant_id": "t-1", "roles": "viewer", "exp": now + 600}),
            SECRET,
        );
        let claims = validator().validate(&jwt).await.unwrap();
        assert_eq!(claims.user_id, "u-2");
        assert_eq!(claims.roles, vec!["viewer"]);
    }

    #[tokio::test]
    async fn test_expired_token_fails() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-1", "tenant_id": "t-1", "roles": [], "exp": now - 120}),
            SECRET,
        );
        let err = validator().validate(&jwt).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_expiry_within_leeway_is_accepted() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-1", "tenant_id": "t-1", "roles": [], "exp": now - 5}),
            SECRET,
        );
        assert!(validator().validate(&jwt).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_signature_fails() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-1", "tenant_id": "t-1", "roles": [], "exp": now + 600}),
            b"some-other-secret",
        );
        let err = validator().validate(&jwt).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid(ref r) if r == "invalid signature"));
    }

    #[tokio::test]
    async fn test_rotated_key_is_picked_up_by_one_forced_refresh() {
        let (validator, source) = rotating_validator(Duration::ZERO);
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-9", "tenant_id": "t-1", "roles": [], "exp": now + 600}),
            ROTATED_SECRET,
        );

        let claims = validator.validate(&jwt).await.unwrap();
        assert_eq!(claims.user_id, "u-9");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        // the rotated key is now cached
        validator.validate(&jwt).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_young_key_is_not_refreshed_on_signature_failure() {
        let (validator, source) = rotating_validator(Duration::from_secs(10));
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-9", "tenant_id": "t-1", "roles": [], "exp": now + 600}),
            ROTATED_SECRET,
        );

        let err = validator.validate(&jwt).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid(ref r) if r == "invalid signature"));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_claims_fail() {
        let now = get_current_timestamp();
        let v = validator();
        let no_tenant = token(json!({"user_id": "u-1", "roles": [], "exp": now + 600}), SECRET);
        assert!(v.validate(&no_tenant).await.is_err());
        let no_roles = token(json!({"user_id": "u-1", "tenant_id": "t", "exp": now + 600}), SECRET);
        assert!(v.validate(&no_roles).await.is_err());
        let no_exp = token(json!({"user_id": "u-1", "tenant_id": "t", "roles": []}), SECRET);
        assert!(v.validate(&no_exp).await.is_err());
    }

    #[tokio::test]
    async fn test_future_iat_beyond_leeway_fails() {
        let now = get_current_timestamp();
        let jwt = token(
            json!({"user_id": "u-1", "tenant_id": "t-1", "roles": [], "exp": now + 600, "iat": now + 300}),
            SECRET,
        );
        assert!(validator().validate(&jwt).await.is_err());
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert!(matches!(extract_bearer(&headers), Err(AuthError::Missing)));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(extract_bearer(&headers), Err(AuthError::Missing)));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc.def.ghi"));
        assert_eq!(extract_bearer(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_auth_errors_map_to_401() {
        let err: GatewayError = AuthError::Missing.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }
}
