//! # Upstream Forwarding
//!
//! Sends one attempt of a proxied request to a backend and classifies what went
//! wrong when it fails. Retrying, breaker bookkeeping and response translation
//! live in the dispatcher; this module only knows about a single round trip.
//!
//! ## Header handling
//! Outbound requests carry the client's headers minus hop-by-hop headers,
//! `Host`, `Content-Length` and any client-supplied identity headers. The
//! gateway then injects its own `X-Correlation-Id`, `X-User-Id`,
//! `X-Tenant-Id`, `X-User-Roles` and `X-Forwarded-For`, so a backend can trust
//! identity headers because only the gateway can have set them.
//!
//! `reqwest` 0.11 is built on `http` 0.2 while axum uses `http` 1.x, so headers
//! and methods cross that boundary by name and bytes.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::core::error::GatewayResult;
use crate::core::retry::FailureKind;
use crate::core::types::RequestContext;
use crate::observability::correlation::CORRELATION_HEADER;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One outbound attempt
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fully buffered backend response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream request failed: {0}")]
    Other(String),
}

impl ForwardError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Connect(_) => FailureKind::Connect,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Other(_) => FailureKind::Other,
        }
    }
}

/// Transport to backend services
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Perform one attempt, bounded by `timeout` end to end
    async fn send(
        &self,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, ForwardError>;
}

/// `reqwest`-backed client; redirects are returned to the caller untouched
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(
        &self,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ForwardError::Other(e.to_string()))?;

        let mut headers = reqwest::header::HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let call = async {
            let response = self
                .client
                .request(method, request.url.clone())
                .headers(headers)
                .body(request.body.clone())
                .send()
                .await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    Some((
                        HeaderName::from_bytes(name.as_str().as_bytes()).ok()?,
                        HeaderValue::from_bytes(value.as_bytes()).ok()?,
                    ))
                })
                .collect::<Vec<_>>();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, header_pairs, body) = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(classify(e, timeout)),
            Err(_) => return Err(ForwardError::Timeout(timeout)),
        };

        let status = StatusCode::from_u16(status)
            .map_err(|e| ForwardError::Other(format!("invalid upstream status: {}", e)))?;
        let mut headers = HeaderMap::with_capacity(header_pairs.len());
        for (name, value) in header_pairs {
            headers.append(name, value);
        }

        debug!(url = %request.url, status = status.as_u16(), "Upstream responded");
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ForwardError {
    if err.is_timeout() {
        ForwardError::Timeout(timeout)
    } else if err.is_connect() {
        ForwardError::Connect(err.to_string())
    } else {
        ForwardError::Other(err.to_string())
    }
}

/// Headers named by the `Connection` header are hop-by-hop too
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_listed(headers) {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Build the outbound header set for `ctx` from the client's headers
pub fn outbound_headers(inbound: &HeaderMap, ctx: &RequestContext) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for name in [USER_ID_HEADER, TENANT_ID_HEADER, USER_ROLES_HEADER] {
        headers.remove(name);
    }

    if let Ok(value) = HeaderValue::from_str(ctx.correlation_id.as_str()) {
        headers.insert(CORRELATION_HEADER, value);
    }

    let identity = [
        (USER_ID_HEADER, ctx.user_id.clone()),
        (TENANT_ID_HEADER, ctx.tenant_id.clone()),
        (
            USER_ROLES_HEADER,
            ctx.is_authenticated()
                .then(|| ctx.roles.iter().cloned().collect::<Vec<_>>().join(",")),
        ),
    ];
    for (name, value) in identity {
        if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(name, value);
        }
    }

    if let Some(ip) = ctx.client_ip {
        let chain = match inbound.get(FORWARDED_FOR_HEADER).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(FORWARDED_FOR_HEADER, value);
        }
    }

    headers
}

/// Headers from a backend response that may be relayed to the client
pub fn relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    headers
}
