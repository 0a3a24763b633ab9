//! `rhythm-breaker`: per-component circuit breakers with exponential backoff.
//!
//! A breaker opens after `failure_threshold` consecutive failures and stays
//! open for `backoff(failures)`.  After that a single half-open trial decides
//! whether the component closes again or re-opens with a longer backoff.

pub mod backoff;
pub mod breaker;
pub mod types;

pub use backoff::BackoffPolicy;
pub use breaker::CircuitBreakers;
pub use types::{BreakerStatus, CircuitBreakerState};
