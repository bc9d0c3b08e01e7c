//! Retry policy.
//!
//! # Responsibilities
//! - Attempt ceilings per priority class (critical gets the largest budget)
//! - Backoff between attempts as a pure function of the attempt number
//!
//! # Design Decisions
//! - The retry loop itself lives in the service router; this module only
//!   answers "how many" and "how long to wait"
//! - Jitter is applied on top of the pure delay, never inside it

use std::time::Duration;

use crate::config::RetryConfig;
use crate::context::PriorityClass;
use crate::resilience::backoff::{calculate_backoff, with_jitter};

/// Retry policy for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` failures, before the next try.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        calculate_backoff(
            failed_attempts,
            self.base_delay.as_millis() as u64,
            self.max_delay.as_millis() as u64,
        )
    }

    /// Backoff with jitter when enabled.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let delay = self.backoff(failed_attempts);
        if self.jitter {
            with_jitter(delay)
        } else {
            delay
        }
    }
}

/// Per-class retry policies.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    config: RetryConfig,
}

impl RetryPolicies {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn for_class(&self, class: PriorityClass) -> RetryPolicy {
        let max_attempts = match class {
            PriorityClass::Normal => self.config.normal_max_attempts,
            PriorityClass::Elevated => self.config.elevated_max_attempts,
            PriorityClass::Critical => self.config.critical_max_attempts,
        };
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(self.config.base_delay_ms),
            max_delay: Duration::from_millis(self.config.max_delay_ms),
            jitter: self.config.jitter,
        }
    }
}
