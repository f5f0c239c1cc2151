//! # Resilience Module
//!
//! Shared stateful guards for the pipeline's only mutable cross-invocation
//! state: the generation-call token bucket, the retry/backoff policy, and
//! the process-local circuit breaker. Each is an explicit object passed by
//! handle into invocations, never an ambient singleton.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use rate_limiter::TokenBucket;
pub use retry::{parse_retry_after, RetryPolicy};
