//! Target selection with failover.
//!
//! # Responsibilities
//! - Turn a logical service name into one admitted backend instance
//! - Retry failed attempts on other instances under the class policy
//! - Report every attempt outcome to the circuit breaker and health score
//! - Expose per-service aggregates for monitoring
//!
//! # Data Flow
//! ```text
//! route(service, class, bypass)
//!     → ServiceCache::candidates (30s TTL, stale on registry error)
//!     → drop instances whose circuit rejects this class
//!     → LoadBalancer::select (health floor, strategy, active count +1)
//!     → CircuitBreakerRegistry::acquire (permit)
//!
//! execute(ctx, service, call)
//!     loop attempt in 1..=max_attempts(class):
//!         deadline check → backoff → route excluding failed → call under timeout
//!         success → permit.success, health reward → return
//!         failure → permit.failure, health penalty, exclude instance
//! ```
//!
//! # Design Decisions
//! - All candidates circuit-open is a fast-fail and does not spend retries;
//!   after failed attempts it ends the request as unavailable instead
//! - Exclusions are dropped when they would leave nothing routable
//! - Structural errors are surfaced at once, other routing errors are retried
//! - Breaker and connection count are released on drop, so a cancelled
//!   request leaks nothing

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{GatewayConfig, TimeoutConfig};
use crate::context::{PriorityClass, RequestContext};
use crate::discovery::{ServiceCache, ServiceRegistry};
use crate::error::{AttemptError, GatewayError};
use crate::health::PassiveHealth;
use crate::load_balancer::{InstanceGuard, LoadBalancer, Selection, ServiceInstance};
use crate::observability::metrics;
use crate::resilience::timeouts::run_with_timeout;
use crate::resilience::{
    Admission, CircuitBreakerRegistry, CircuitPermit, CircuitState, RetryPolicies, TimeoutPolicy,
};

/// An admitted backend target.
#[derive(Debug)]
pub struct Target {
    selection: Selection,
    permit: CircuitPermit,
}

impl Target {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        self.selection.instance()
    }

    pub fn admission(&self) -> Admission {
        self.permit.admission()
    }

    /// Chosen from below the health floor.
    pub fn degraded(&self) -> bool {
        self.selection.degraded
    }
}

/// Successful outcome of [`ServiceRouter::execute`].
///
/// Holds the instance's active-connection slot until dropped.
#[derive(Debug)]
pub struct Routed<T> {
    pub value: T,
    pub guard: InstanceGuard,
    pub attempts: u32,
}

impl<T> Routed<T> {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        self.guard.instance()
    }
}

/// Per-instance monitoring view.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub health_score: f64,
    pub active_connections: usize,
    pub avg_response_time_ms: f64,
    pub circuit_state: CircuitState,
}

/// Per-service aggregate: `{health_score, active_connections, circuit_state, avg_response_time_ms}`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub health_score: f64,
    pub active_connections: usize,
    pub circuit_state: CircuitState,
    pub avg_response_time_ms: f64,
    pub instances: Vec<InstanceSnapshot>,
}

/// Orchestrates cache, load balancer, circuit breakers and retries.
pub struct ServiceRouter {
    cache: Arc<ServiceCache>,
    balancer: LoadBalancer,
    breakers: Arc<CircuitBreakerRegistry>,
    retries: RetryPolicies,
    timeouts: TimeoutConfig,
    health: PassiveHealth,
}

impl ServiceRouter {
    pub fn new(
        cache: Arc<ServiceCache>,
        balancer: LoadBalancer,
        breakers: Arc<CircuitBreakerRegistry>,
        retries: RetryPolicies,
        timeouts: TimeoutConfig,
        health: PassiveHealth,
    ) -> Self {
        Self {
            cache,
            balancer,
            breakers,
            retries,
            timeouts,
            health,
        }
    }

    pub fn from_config(config: &GatewayConfig, registry: Arc<dyn ServiceRegistry>) -> Self {
        let cache = Arc::new(ServiceCache::new(
            registry,
            Duration::from_secs(config.registry.cache_ttl_secs),
        ));
        Self::new(
            cache,
            LoadBalancer::from_config(&config.load_balancer),
            Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            RetryPolicies::new(config.retries.clone()),
            config.timeouts.clone(),
            PassiveHealth::from_config(&config.health_check),
        )
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn timeouts(&self, class: PriorityClass) -> TimeoutPolicy {
        TimeoutPolicy::for_class(&self.timeouts, class)
    }

    /// Pick and admit one instance of `service`.
    pub async fn route(
        &self,
        service: &str,
        class: PriorityClass,
        bypass: bool,
    ) -> Result<Target, GatewayError> {
        self.route_excluding(service, class, bypass, &[]).await
    }

    /// Like [`route`](Self::route) but avoiding `excluded` instance ids when possible.
    pub async fn route_excluding(
        &self,
        service: &str,
        class: PriorityClass,
        bypass: bool,
        excluded: &[String],
    ) -> Result<Target, GatewayError> {
        let candidates = self.cache.candidates(service).await?;
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstance(service.to_string()));
        }

        let mut pool: Vec<Arc<ServiceInstance>> = candidates
            .iter()
            .filter(|i| !excluded.contains(&i.id))
            .filter(|i| self.breakers.is_routable(&i.id, class, bypass))
            .cloned()
            .collect();
        // Exclusions only steer: fall back to every candidate when they
        // leave nothing routable.
        if pool.is_empty() {
            pool = candidates.to_vec();
        }

        loop {
            let routable: Vec<Arc<ServiceInstance>> = pool
                .iter()
                .filter(|i| self.breakers.is_routable(&i.id, class, bypass))
                .cloned()
                .collect();
            if routable.is_empty() {
                return Err(GatewayError::CircuitOpen(service.to_string()));
            }

            let selection = self.balancer.select(service, &routable, class)?;
            match self.breakers.acquire(&selection.instance().id, class, bypass) {
                Ok(permit) => return Ok(Target { selection, permit }),
                // Another request took the trial slot between check and acquire.
                Err(_) => {
                    let lost = selection.instance().id.clone();
                    pool.retain(|i| i.id != lost);
                }
            }
        }
    }

    /// Record a successful attempt and keep the connection slot.
    pub fn succeed(&self, target: Target, elapsed: Duration) -> InstanceGuard {
        let Target { selection, permit } = target;
        permit.success();
        let score = self.health.on_success(selection.instance(), Some(elapsed));
        tracing::trace!(instance = %selection.instance().id, health = score, "Attempt succeeded");
        selection.guard
    }

    /// Record a failed attempt.
    pub fn fail(&self, target: Target) {
        let Target { selection, permit } = target;
        permit.failure();
        self.health.on_failure(selection.instance());
    }

    /// Record a failure observed outside an attempt, e.g. a dropped WebSocket link.
    pub fn record_failure(&self, instance: &ServiceInstance, class: PriorityClass) {
        if let Ok(permit) = self.breakers.acquire(&instance.id, class, false) {
            permit.failure();
        }
        self.health.on_failure(instance);
    }

    /// Run `call` against instances of `service` until it succeeds, the retry
    /// ceiling for the request's class is reached, or the deadline passes.
    ///
    /// `call` receives the instance and the time budget for that attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        mut call: F,
    ) -> Result<Routed<T>, GatewayError>
    where
        F: FnMut(Arc<ServiceInstance>, Duration) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let class = ctx.priority();
        let bypass = ctx.bypass_circuit();
        let policy = self.retries.for_class(class);
        let timeouts = self.timeouts(class);
        let deadline = ctx.deadline();

        let mut excluded: Vec<String> = Vec::new();
        let mut failures: u32 = 0;
        let mut last_timed_out = false;

        while failures < policy.max_attempts {
            if deadline.is_expired() {
                return Err(self.deadline_exceeded(ctx, service));
            }

            if failures > 0 {
                let delay = policy.delay(failures);
                if delay >= deadline.remaining() {
                    return Err(self.deadline_exceeded(ctx, service));
                }
                metrics::record_retry(service, class);
                tokio::time::sleep(delay).await;
            }

            let target = match self.route_excluding(service, class, bypass, &excluded).await {
                Ok(target) => target,
                Err(GatewayError::CircuitOpen(_)) if failures > 0 => {
                    // Earlier attempts opened the last circuits; report the
                    // failed attempts rather than the fast-fail.
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        service = %service,
                        class = %class,
                        attempts = failures,
                        "No routable instance left after failures"
                    );
                    last_timed_out = false;
                    break;
                }
                Err(e)
                    if e.is_structural()
                        || matches!(e, GatewayError::CircuitOpen(_) | GatewayError::Registry(_)) =>
                {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        service = %service,
                        class = %class,
                        error = %e,
                        "Routing failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        service = %service,
                        error = %e,
                        "No instance available, will retry"
                    );
                    failures += 1;
                    last_timed_out = false;
                    continue;
                }
            };

            let attempt = ctx.next_attempt();
            let instance = target.instance().clone();
            let budget = timeouts.attempt_budget(&deadline);
            let started = Instant::now();

            tracing::debug!(
                correlation_id = %ctx.correlation_id(),
                service = %service,
                instance = %instance.id,
                class = %class,
                attempt = attempt,
                admission = ?target.admission(),
                budget = ?budget,
                "Dispatching attempt"
            );

            match run_with_timeout(budget, call(instance.clone(), budget)).await {
                Ok(value) => {
                    let guard = self.succeed(target, started.elapsed());
                    return Ok(Routed {
                        value,
                        guard,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        service = %service,
                        instance = %instance.id,
                        class = %class,
                        attempt = attempt,
                        error = %err,
                        "Attempt failed"
                    );
                    self.fail(target);
                    if !excluded.contains(&instance.id) {
                        excluded.push(instance.id.clone());
                    }
                    failures += 1;
                    last_timed_out = err == AttemptError::Timeout;
                }
            }
        }

        tracing::error!(
            correlation_id = %ctx.correlation_id(),
            service = %service,
            class = %class,
            attempts = failures,
            "Retry budget exhausted"
        );
        if last_timed_out {
            Err(GatewayError::Timeout(service.to_string()))
        } else {
            Err(GatewayError::ServiceUnavailable {
                service: service.to_string(),
                attempts: failures,
            })
        }
    }

    fn deadline_exceeded(&self, ctx: &RequestContext, service: &str) -> GatewayError {
        tracing::warn!(
            correlation_id = %ctx.correlation_id(),
            service = %service,
            attempts = ctx.attempt(),
            "Request deadline exceeded, aborting retries"
        );
        GatewayError::Timeout(service.to_string())
    }

    /// Aggregate view of one cached service.
    pub fn service_snapshot(&self, service: &str) -> Option<ServiceSnapshot> {
        let instances = self.cache.cached(service)?;
        let snapshots: Vec<InstanceSnapshot> = instances
            .iter()
            .map(|i| InstanceSnapshot {
                id: i.id.clone(),
                address: i.address.clone(),
                weight: i.weight,
                health_score: i.health_score(),
                active_connections: i.active_connections(),
                avg_response_time_ms: i.avg_response_time_ms(),
                circuit_state: self.breakers.state(&i.id, PriorityClass::Normal),
            })
            .collect();

        let count = snapshots.len().max(1) as f64;
        Some(ServiceSnapshot {
            service: service.to_string(),
            health_score: snapshots.iter().map(|s| s.health_score).sum::<f64>() / count,
            active_connections: snapshots.iter().map(|s| s.active_connections).sum(),
            circuit_state: snapshots
                .iter()
                .map(|s| s.circuit_state)
                .max_by_key(|s| s.severity())
                .unwrap_or(CircuitState::Closed),
            avg_response_time_ms: snapshots.iter().map(|s| s.avg_response_time_ms).sum::<f64>() / count,
            instances: snapshots,
        })
    }

    /// Aggregates for every cached service, sorted by name.
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut services = self.cache.services();
        services.sort();
        services
            .iter()
            .filter_map(|s| self.service_snapshot(s))
            .collect()
    }
}
