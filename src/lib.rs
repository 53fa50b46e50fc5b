//! # Dispatch Gateway - Core Library Crate
//!
//! The request dispatch pipeline of an API gateway sitting in front of a set of
//! backend microservices. Every inbound request passes through the same stages:
//!
//! 1. correlation id assignment
//! 2. route resolution by longest path prefix
//! 3. bearer token validation (except on public paths)
//! 4. rate limiting per ip, user, tenant and endpoint
//! 5. the per-route circuit breaker
//! 6. forwarding with retries for idempotent methods
//!
//! Around the pipeline sit a background health monitor, readiness and
//! discovery endpoints, Prometheus metrics and an admin API.
//!
//! ## Using the library
//!
//! ```rust,no_run
//! use dispatch_gateway::{AppState, GatewayConfig, GatewayServer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> dispatch_gateway::GatewayResult<()> {
//! let config = GatewayConfig::load_from_file("config/gateway.yaml").await?;
//! let state = AppState::from_config(config, None)?;
//! GatewayServer::new(state)?.run(CancellationToken::new()).await
//! # }
//! ```

/// Error types, configuration, retry policy, circuit breaker and shared data types
pub mod core;

/// Signing keys, token validation and role checks
pub mod auth;

/// Path normalization and the copy-on-write service registry
pub mod routing;

/// Per-request middleware and the rate limiter
pub mod middleware;

/// Correlation ids, logging, metrics and the health monitor
pub mod observability;

/// The dispatcher, the upstream forwarder and the HTTP server
pub mod gateway;

/// Operator endpoints under `/api/v1/admin`
pub mod admin;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{RequestContext, ServiceRoute};
pub use gateway::server::{build_router, AppState, Collaborators, GatewayServer};
pub use routing::registry::ServiceRegistry;
