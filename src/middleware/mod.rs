//! Request-level middleware and the rate limiter the dispatcher consults.

pub mod rate_limiting;
pub mod request_context;

pub use rate_limiting::{CounterStore, InMemoryCounterStore, RateLimiter, RedisCounterStore};
pub use request_context::{request_context, ResponseHeaderPolicy};
