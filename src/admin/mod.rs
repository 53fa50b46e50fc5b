//! # Admin Module
//!
//! Operator endpoints for inspecting and adjusting the running gateway:
//! service routes, rate limits, circuit breakers and signing-key state.
//! All of them require a token carrying the admin role (see [`guard`]).

pub mod endpoints;
pub mod guard;

pub use endpoints::AdminRouter;
pub use guard::require_admin;
