//! Admin access control.
//!
//! Every admin route requires a valid bearer token. The admin role is taken
//! from the token when present; otherwise the authorization service decides.
//! Without an authorization service the token's roles are final.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::auth::claims::{extract_bearer, Claims};
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::server::AppState;

/// Middleware guarding the admin router
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authorize(&state, request.headers()).await {
        Ok(claims) => {
            info!(
                user_id = %claims.user_id,
                method = %request.method(),
                path = %request.uri().path(),
                "Admin request"
            );
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            warn!(error = %e, path = %request.uri().path(), "Admin access denied");
            e.into_response()
        }
    }
}

/// Validate the caller's token and confirm the admin role
pub async fn authorize(state: &AppState, headers: &HeaderMap) -> GatewayResult<Claims> {
    let token = extract_bearer(headers)?;
    let claims = state.validator.validate(token).await?;

    let admin_role = state.config.auth.admin_role.as_str();
    if claims.roles.iter().any(|role| role == admin_role) {
        return Ok(claims);
    }

    if let Some(checker) = &state.role_checker {
        if checker
            .has_role(&claims.user_id, &claims.tenant_id, admin_role)
            .await
        {
            return Ok(claims);
        }
    }

    Err(GatewayError::authz(format!(
        "role {} required",
        admin_role
    )))
}
