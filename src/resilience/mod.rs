//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against an instance:
//!     → circuit_breaker.rs (admit or fail fast, per instance and class)
//!     → timeouts.rs (attempt timeout clamped to the outer deadline)
//!     → On failure: retries.rs (class ceiling, backoff.rs delay)
//!     → outcome reported back to circuit_breaker.rs
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Circuit breaker prevents cascading failures
//! - Retry budgets and breaker thresholds depend on priority class

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{Admission, CircuitBreakerRegistry, CircuitPermit, CircuitState};
pub use retries::{RetryPolicies, RetryPolicy};
pub use timeouts::TimeoutPolicy;
