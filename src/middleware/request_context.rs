//! Outermost per-request middleware.
//!
//! Assigns the correlation id before anything else runs, makes it visible to
//! every later stage (request header, request extension and task-local), and
//! stamps it plus the security headers onto whatever response comes back,
//! including error envelopes produced deep inside the pipeline.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::observability::correlation::{self, CORRELATION_HEADER};

/// Response header policy applied by [`request_context`]
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeaderPolicy {
    pub security_headers: bool,
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", "default-src 'self'"),
];

pub async fn request_context(
    State(policy): State<ResponseHeaderPolicy>,
    mut request: Request,
    next: Next,
) -> Response {
    let correlation_id = correlation::ensure(request.headers());
    let header_value = HeaderValue::from_str(correlation_id.as_str()).ok();

    if let Some(value) = &header_value {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }
    request.extensions_mut().insert(correlation_id.clone());

    let span = tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = correlation::scope(correlation_id, next.run(request))
        .instrument(span)
        .await;

    let headers = response.headers_mut();
    if let Some(value) = header_value {
        headers.insert(CORRELATION_HEADER, value);
    }
    if policy.security_headers {
        for (name, value) in SECURITY_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
    }
    response
}
