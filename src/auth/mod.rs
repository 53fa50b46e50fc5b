//! # Authentication and Authorization
//!
//! - [`keys`]: signing-key sources and the process-wide key cache
//! - [`claims`]: bearer token validation into identity claims
//! - [`authz`]: role checks against the authorization service

pub mod authz;
pub mod claims;
pub mod keys;

pub use authz::{HttpRoleChecker, RoleChecker};
pub use claims::{extract_bearer, AuthError, Claims, ClaimsValidator};
pub use keys::{KeySource, KeySourceError, SigningKeyCache};

/// Whether `path` skips authentication.
///
/// Entries match exactly, or by prefix when they end in `*`.
pub fn is_public_path(public_paths: &[String], path: &str) -> bool {
    public_paths.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    })
}
