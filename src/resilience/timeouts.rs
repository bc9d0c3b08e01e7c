//! Timeout enforcement.
//!
//! # Responsibilities
//! - Per-class attempt timeouts and outer request deadlines
//! - Clamp each attempt to whatever the outer deadline has left
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the future cancels the call
//! - Critical traffic gets the most generous budget

use std::future::Future;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::context::{Deadline, PriorityClass};
use crate::error::AttemptError;

/// Timeouts for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub attempt: Duration,
    pub deadline: Duration,
}

impl TimeoutPolicy {
    pub fn for_class(config: &TimeoutConfig, class: PriorityClass) -> Self {
        let t = config.for_class(class);
        Self {
            attempt: Duration::from_millis(t.attempt_ms),
            deadline: Duration::from_millis(t.deadline_ms),
        }
    }

    /// Budget for the next attempt under `deadline`.
    pub fn attempt_budget(&self, deadline: &Deadline) -> Duration {
        self.attempt.min(deadline.remaining())
    }
}

/// Run `fut` under `budget`; elapsed budget maps to [`AttemptError::Timeout`].
pub async fn run_with_timeout<T, F>(budget: Duration, fut: F) -> Result<T, AttemptError>
where
    F: Future<Output = Result<T, AttemptError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(AttemptError::Timeout),
    }
}
