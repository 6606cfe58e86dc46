//! Concurrency-governance primitives.
//!
//! Shared between the plan executor and the sub-agent fan-out dispatcher:
//! token-bucket admission control, idempotent result caching, circuit
//! breaking, and resource-quota tracking.

mod circuit_breaker;
mod idempotency;
mod rate_limiter;
mod tracker;

pub use circuit_breaker::CircuitBreaker;
pub use idempotency::{idempotency_key, IdempotencyCache, IdempotencyRecord, RecordStatus};
pub use rate_limiter::RateLimiter;
pub use tracker::{DispatchLimitTracker, DispatchResourceLimits, DispatchStats};
