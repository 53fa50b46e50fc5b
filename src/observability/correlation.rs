//! # Correlation Manager
//!
//! Every request gets exactly one correlation id. A well-formed inbound
//! `X-Correlation-Id` is reused as-is; anything else is replaced by a freshly
//! generated UUID v7 (millisecond timestamp plus random bits), so ids sort
//! roughly by creation time without being guessable.
//!
//! The id of the request currently being handled is also kept in a tokio
//! task-local, which lets error responses built far from the handler (for
//! example `GatewayError::into_response`) stamp the right id into the envelope.

use axum::http::HeaderMap;
use serde::Serialize;
use std::future::Future;
use uuid::Uuid;

/// Inbound and outbound header name (lowercase, as stored by `http`)
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

tokio::task_local! {
    static CURRENT: CorrelationId;
}

/// Correlation ID for tracking requests across services
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new time-ordered, random correlation id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Accept a caller-supplied id if it is well-formed
    pub fn parse(raw: &str) -> Option<Self> {
        is_well_formed(raw).then(|| Self(raw.to_string()))
    }

    /// Get the correlation ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reuse the inbound correlation id or mint a new one. Never fails.
pub fn ensure(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| CorrelationId::parse(raw.trim()))
        .unwrap_or_else(CorrelationId::generate)
}

/// 1..=128 characters of `[A-Za-z0-9._:-]`
pub fn is_well_formed(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_CORRELATION_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Run `fut` with `id` as the current correlation id
pub async fn scope<F: Future>(id: CorrelationId, fut: F) -> F::Output {
    CURRENT.scope(id, fut).await
}

/// Correlation id of the request being handled on this task, if any
pub fn current() -> Option<CorrelationId> {
    CURRENT.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique() {
        let headers = HeaderMap::new();
        let ids: HashSet<CorrelationId> = (0..10_000).map(|_| ensure(&headers)).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_well_formed_id_is_echoed() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("req-42:abc.DEF_9"));
        assert_eq!(ensure(&headers).as_str(), "req-42:abc.DEF_9");
    }

    #[test]
    fn test_malformed_ids_are_replaced() {
        for bad in ["", "has space", "semi;colon", &"x".repeat(129)] {
            let mut headers = HeaderMap::new();
            headers.insert(CORRELATION_HEADER, HeaderValue::from_str(bad).unwrap());
            let id = ensure(&headers);
            assert_ne!(id.as_str(), bad);
            assert!(Uuid::parse_str(id.as_str()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_task_local_scope() {
        assert!(current().is_none());
        let id = CorrelationId::generate();
        let seen = scope(id.clone(), async { current() }).await;
        assert_eq!(seen, Some(id));
    }
}
