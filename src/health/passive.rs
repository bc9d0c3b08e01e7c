//! Passive health scoring.
//!
//! # Design Decisions
//! - Connection errors, timeouts and 502/503/504 count as failures
//! - 4xx are NOT failures (client error, not backend)
//! - Penalty outweighs reward so a flapping instance drifts down

use std::time::Duration;

use crate::config::HealthCheckConfig;
use crate::load_balancer::ServiceInstance;

/// Score adjustments applied on every observed outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassiveHealth {
    pub success_reward: f64,
    pub failure_penalty: f64,
}

impl PassiveHealth {
    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self {
            success_reward: config.success_reward,
            failure_penalty: config.failure_penalty,
        }
    }

    pub fn on_success(&self, instance: &ServiceInstance, elapsed: Option<Duration>) -> f64 {
        if let Some(elapsed) = elapsed {
            instance.record_latency(elapsed);
        }
        instance.adjust_health(self.success_reward)
    }

    pub fn on_failure(&self, instance: &ServiceInstance) -> f64 {
        let score = instance.adjust_health(-self.failure_penalty);
        tracing::debug!(instance = %instance.id, health = score, "Instance penalised");
        score
    }
}

impl Default for PassiveHealth {
    fn default() -> Self {
        Self::from_config(&HealthCheckConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_sink_below_floor() {
        let passive = PassiveHealth::default();
        let instance = ServiceInstance::new("a", "127.0.0.1:1", 1);
        for _ in 0..5 {
            passive.on_failure(&instance);
        }
        assert!(instance.health_score() < 0.30);
        for _ in 0..5 {
            passive.on_failure(&instance);
        }
        assert_eq!(instance.health_score(), 0.0);
    }

    #[test]
    fn test_success_clamps_and_records_latency() {
        let passive = PassiveHealth::default();
        let instance = ServiceInstance::new("a", "127.0.0.1:1", 1);
        assert_eq!(passive.on_success(&instance, Some(Duration::from_millis(40))), 1.0);
        assert!(instance.avg_response_time_ms() > 0.0);
    }
}
