//! Role checks against the external authorization service.
//!
//! Only consulted for admin routes when the token itself lacks the admin role.
//! Every failure (timeout, non-200, unparsable body) denies access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};
use url::Url;

use crate::core::error::GatewayResult;
use crate::observability::correlation::{self, CORRELATION_HEADER};

#[async_trait]
pub trait RoleChecker: Send + Sync {
    /// Whether the user holds `role` in the tenant; `false` on any error
    async fn has_role(&self, user_id: &str, tenant_id: &str, role: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct RoleCheckRequest<'a> {
    user_id: &'a str,
    tenant_id: &'a str,
    role: &'a str,
}

#[derive(Debug, Deserialize)]
struct RoleCheckResponse {
    #[serde(default)]
    has_role: bool,
}

/// `POST {base}/api/v1/authz/roles/check`
pub struct HttpRoleChecker {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpRoleChecker {
    pub fn new(base_url: &Url, timeout: Duration) -> GatewayResult<Self> {
        let endpoint = base_url
            .join("/api/v1/authz/roles/check")
            .map_err(|e| crate::config_error!("Invalid authz service URL {}: {}", base_url, e))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RoleChecker for HttpRoleChecker {
    async fn has_role(&self, user_id: &str, tenant_id: &str, role: &str) -> bool {
        let mut request = self.client.post(self.endpoint.clone()).json(&RoleCheckRequest {
            user_id,
            tenant_id,
            role,
        });
        if let Some(id) = correlation::current() {
            request = request.header(CORRELATION_HEADER, id.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Role check request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Role check rejected");
            return false;
        }

        match response.json::<RoleCheckResponse>().await {
            Ok(body) => body.has_role,
            Err(e) => {
                warn!(error = %e, "Role check returned an unreadable body");
                false
            }
        }
    }
}
