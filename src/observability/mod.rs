//! # Observability
//!
//! - [`correlation`]: per-request correlation ids
//! - [`health`]: background health probing and readiness
//! - [`logging`]: `tracing` subscriber setup
//! - [`metrics`]: Prometheus recorder and recording helpers

// Request correlation
pub mod correlation;

// Health checks and readiness
pub mod health;

// Structured logging
pub mod logging;

// Metrics collection
pub mod metrics;

// Re-export commonly used types for convenience
pub use correlation::{CorrelationId, CORRELATION_HEADER};
pub use health::{HealthMonitor, HealthProbe, HttpHealthProbe, ServiceHealth, ServiceStatus};
pub use logging::init_logging;
