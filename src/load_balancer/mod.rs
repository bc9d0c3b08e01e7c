//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Candidates for a service (from the discovery cache, circuit-filtered)
//!     → drop instances below the health floor (unless none would remain)
//!     → compute effective weights (priority boost applied first)
//!     → apply strategy:
//!         - round_robin.rs (rotate through instances)
//!         - weighted.rs (weighted round-robin, health-weighted draw)
//!         - least_conn.rs (fewest active connections per weight)
//!     → instance.rs (increment active count, return guard)
//! ```
//!
//! # Design Decisions
//! - Strategy set is closed; one `select` dispatches over it
//! - Candidates are ordered by id so selection is deterministic under test
//! - Tie-break: lowest active connections, then lowest id

pub mod instance;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{LoadBalancerConfig, StrategyKind};
use crate::context::PriorityClass;
use crate::error::GatewayError;
use crate::observability::metrics;

pub use instance::{InstanceGuard, ServiceInstance};

/// Default health floor below which instances are excluded.
pub const HEALTH_FLOOR: f64 = 0.30;

/// Instances at or above this score receive the priority boost.
pub const PREFERRED_HEALTH: f64 = 0.80;

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    HealthWeighted,
    /// Boosts effective weight of preferred instances by the request's
    /// class multiplier, then applies the inner strategy.
    PriorityBoosted(StrategyKind),
}

impl Strategy {
    pub fn from_config(config: &LoadBalancerConfig) -> Self {
        if config.priority_boost {
            return Strategy::PriorityBoosted(config.strategy);
        }
        match config.strategy {
            StrategyKind::RoundRobin => Strategy::RoundRobin,
            StrategyKind::WeightedRoundRobin => Strategy::WeightedRoundRobin,
            StrategyKind::LeastConnections => Strategy::LeastConnections,
            StrategyKind::HealthWeighted => Strategy::HealthWeighted,
        }
    }

    fn base(&self) -> StrategyKind {
        match self {
            Strategy::RoundRobin => StrategyKind::RoundRobin,
            Strategy::WeightedRoundRobin => StrategyKind::WeightedRoundRobin,
            Strategy::LeastConnections => StrategyKind::LeastConnections,
            Strategy::HealthWeighted => StrategyKind::HealthWeighted,
            Strategy::PriorityBoosted(kind) => *kind,
        }
    }
}

/// Result of a selection. Dropping it releases the active connection.
#[derive(Debug)]
pub struct Selection {
    pub guard: InstanceGuard,
    /// Set when every candidate was below the health floor.
    pub degraded: bool,
}

impl Selection {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        self.guard.instance()
    }
}

/// Picks one instance per request.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
    health_floor: f64,
    /// Rotating counters per service.
    counters: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            health_floor: HEALTH_FLOOR,
            counters: DashMap::new(),
        }
    }

    pub fn from_config(config: &LoadBalancerConfig) -> Self {
        Self::new(Strategy::from_config(config)).with_health_floor(config.health_floor)
    }

    pub fn with_health_floor(mut self, floor: f64) -> Self {
        self.health_floor = floor;
        self
    }

    /// Select an instance for `service` and increment its active count.
    pub fn select(
        &self,
        service: &str,
        candidates: &[Arc<ServiceInstance>],
        class: PriorityClass,
    ) -> Result<Selection, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstance(service.to_string()));
        }

        let mut ordered: Vec<Arc<ServiceInstance>> = candidates.to_vec();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let eligible: Vec<Arc<ServiceInstance>> = ordered
            .iter()
            .filter(|i| i.health_score() >= self.health_floor)
            .cloned()
            .collect();

        if eligible.is_empty() {
            let fallback = ordered
                .iter()
                .max_by(|a, b| {
                    a.health_score()
                        .total_cmp(&b.health_score())
                        .then_with(|| prefer_lower(a, b))
                })
                .cloned()
                .ok_or_else(|| GatewayError::NoHealthyInstance(service.to_string()))?;

            tracing::warn!(
                service = %service,
                instance = %fallback.id,
                health = fallback.health_score(),
                "All candidates below health floor, degraded selection"
            );
            metrics::record_degraded_selection(service);
            return Ok(Selection {
                guard: fallback.acquire(),
                degraded: true,
            });
        }

        let weights = self.effective_weights(&eligible, class);
        let index = match self.strategy.base() {
            StrategyKind::RoundRobin if !matches!(self.strategy, Strategy::PriorityBoosted(_)) => {
                round_robin::pick(eligible.len(), self.tick(service))
            }
            StrategyKind::RoundRobin | StrategyKind::WeightedRoundRobin => {
                weighted::pick_round_robin(&weights, self.tick(service))
            }
            StrategyKind::LeastConnections => least_conn::pick(&eligible, &weights),
            StrategyKind::HealthWeighted => {
                let scored: Vec<f64> = eligible
                    .iter()
                    .zip(&weights)
                    .map(|(i, w)| i.health_score() * w)
                    .collect();
                weighted::pick_proportional(&scored, fastrand::f64())
            }
        };

        let chosen = match index {
            Some(index) => eligible[index].clone(),
            None => tie_break(&eligible)
                .ok_or_else(|| GatewayError::NoHealthyInstance(service.to_string()))?,
        };

        tracing::trace!(
            service = %service,
            instance = %chosen.id,
            class = %class,
            strategy = ?self.strategy,
            "Instance selected"
        );

        Ok(Selection {
            guard: chosen.acquire(),
            degraded: false,
        })
    }

    /// Effective weight per candidate, with the priority boost applied.
    fn effective_weights(&self, candidates: &[Arc<ServiceInstance>], class: PriorityClass) -> Vec<f64> {
        candidates
            .iter()
            .map(|instance| {
                let base = match self.strategy {
                    Strategy::RoundRobin => 1.0,
                    Strategy::PriorityBoosted(StrategyKind::RoundRobin) => 1.0,
                    Strategy::HealthWeighted => 1.0,
                    Strategy::PriorityBoosted(StrategyKind::HealthWeighted) => 1.0,
                    _ => instance.weight as f64,
                };
                match self.strategy {
                    Strategy::PriorityBoosted(_) if instance.health_score() >= PREFERRED_HEALTH => {
                        base * class.boost()
                    }
                    _ => base,
                }
            })
            .collect()
    }

    fn tick(&self, service: &str) -> usize {
        if let Some(counter) = self.counters.get(service) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Lower active count wins, then lower id.
fn prefer_lower(a: &ServiceInstance, b: &ServiceInstance) -> CmpOrdering {
    b.active_connections()
        .cmp(&a.active_connections())
        .then_with(|| b.id.cmp(&a.id))
}

fn tie_break(candidates: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.active_connections()
                .cmp(&b.active_connections())
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(specs: &[(&str, u32, f64)]) -> Vec<Arc<ServiceInstance>> {
        specs
            .iter()
            .map(|(id, weight, health)| {
                let i = ServiceInstance::new(*id, format!("127.0.0.1:{}", 9000 + weight), *weight);
                i.set_health(*health);
                Arc::new(i)
            })
            .collect()
    }

    #[test]
    fn test_round_robin_rotates_in_id_order() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let pool = instances(&[("b", 1, 1.0), ("a", 1, 1.0)]);
        let ids: Vec<String> = (0..4)
            .map(|_| lb.select("svc", &pool, PriorityClass::Normal).unwrap().instance().id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_counts_released_on_drop() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let pool = instances(&[("a", 1, 1.0), ("b", 1, 1.0)]);
        let first = lb.select("svc", &pool, PriorityClass::Normal).unwrap();
        assert_eq!(first.instance().id, "a");
        let second = lb.select("svc", &pool, PriorityClass::Normal).unwrap();
        assert_eq!(second.instance().id, "b");
        drop(first);
        assert_eq!(pool[0].active_connections(), 0);
        assert_eq!(pool[1].active_connections(), 1);
    }

    #[test]
    fn test_never_selects_below_floor_when_alternatives_exist() {
        for strategy in [
            Strategy::RoundRobin,
            Strategy::WeightedRoundRobin,
            Strategy::LeastConnections,
            Strategy::HealthWeighted,
            Strategy::PriorityBoosted(StrategyKind::LeastConnections),
        ] {
            let lb = LoadBalancer::new(strategy);
            let pool = instances(&[("a", 5, 0.29), ("b", 1, 0.31), ("c", 1, 0.1)]);
            for _ in 0..50 {
                let s = lb.select("svc", &pool, PriorityClass::Critical).unwrap();
                assert_eq!(s.instance().id, "b", "strategy {:?}", strategy);
                assert!(!s.degraded);
            }
        }
    }

    #[test]
    fn test_degraded_returns_highest_health() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let pool = instances(&[("a", 1, 0.1), ("b", 1, 0.2), ("c", 1, 0.05)]);
        let s = lb.select("svc", &pool, PriorityClass::Normal).unwrap();
        assert!(s.degraded);
        assert_eq!(s.instance().id, "b");
    }

    #[test]
    fn test_degraded_tie_breaks_on_connections_then_id() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let pool = instances(&[("a", 1, 0.2), ("b", 1, 0.2), ("c", 1, 0.2)]);
        pool[0].inc_connections();
        let s = lb.select("svc", &pool, PriorityClass::Normal).unwrap();
        assert_eq!(s.instance().id, "b");
    }

    #[test]
    fn test_empty_candidates() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let err = lb.select("svc", &[], PriorityClass::Normal).unwrap_err();
        assert_eq!(err, GatewayError::NoHealthyInstance("svc".into()));
    }

    #[test]
    fn test_weighted_round_robin_uses_static_weight() {
        let lb = LoadBalancer::new(Strategy::WeightedRoundRobin);
        let pool = instances(&[("a", 1, 1.0), ("b", 3, 1.0)]);
        let mut b_hits = 0;
        for _ in 0..40 {
            if lb.select("svc", &pool, PriorityClass::Normal).unwrap().instance().id == "b" {
                b_hits += 1;
            }
        }
        assert_eq!(b_hits, 30);
    }

    #[test]
    fn test_priority_boost_favours_preferred_instances() {
        let lb = LoadBalancer::new(Strategy::PriorityBoosted(StrategyKind::RoundRobin));
        let pool = instances(&[("a", 1, 1.0), ("b", 1, 0.5)]);

        let count_a = |class| {
            (0..40)
                .filter(|_| lb.select("svc", &pool, class).unwrap().instance().id == "a")
                .count()
        };
        // critical: a owns 20 of 30 slots
        assert_eq!(count_a(PriorityClass::Critical), 30);
        // normal: no boost, 10 of 20 slots
        assert_eq!(count_a(PriorityClass::Normal), 20);
    }

    #[test]
    fn test_health_weighted_skips_zero_share() {
        let lb = LoadBalancer::new(Strategy::HealthWeighted);
        let pool = instances(&[("a", 1, 1.0)]);
        for _ in 0..10 {
            assert_eq!(lb.select("svc", &pool, PriorityClass::Normal).unwrap().instance().id, "a");
        }
    }
}
