//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: instance assumed down, requests fail fast
//! - Half-Open: testing if instance recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= class threshold within window
//! Open → Half-Open: first routing attempt after the cooldown deadline
//! Half-Open → Closed: trial request succeeds
//! Half-Open → Open: trial request fails (fresh cooldown)
//! ```
//!
//! # Design Decisions
//! - One breaker per (instance, priority class), created on first use
//! - Fail fast in Open state (no waiting for timeout)
//! - Single trial in Half-Open (prevents hammering a recovering instance)
//! - Critical requests carrying the bypass flag get one probe per
//!   open episode; a failed probe never touches state or cooldown
//! - Every admission is a permit; dropping it unsettled frees the trial slot

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::context::PriorityClass;
use crate::error::GatewayError;
use crate::observability::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Severity used when aggregating across instances.
    pub fn severity(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// How a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Normal,
    /// The single half-open trial.
    Trial,
    /// Critical bypass probe through an open circuit.
    Bypass,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub window: Duration,
}

impl BreakerSettings {
    pub fn for_class(config: &CircuitBreakerConfig, class: PriorityClass) -> Self {
        let c = config.for_class(class);
        Self {
            failure_threshold: c.failure_threshold,
            cooldown: Duration::from_secs(c.cooldown_secs),
            window: config.window(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_transition: Instant,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    bypass_used: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: usize,
    pub last_transition: Instant,
    pub open_until: Option<Instant>,
}

/// Circuit breaker for a single (instance, class) pair.
#[derive(Debug)]
pub struct CircuitBreaker {
    instance_id: String,
    class: PriorityClass,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(instance_id: impl Into<String>, class: PriorityClass, settings: BreakerSettings) -> Self {
        Self {
            instance_id: instance_id.into(),
            class,
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_transition: Instant::now(),
                open_until: None,
                trial_in_flight: false,
                bypass_used: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    /// Whether a request could currently pass, without changing state.
    pub fn is_routable_at(&self, bypass: bool, now: Instant) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.open_until.is_some_and(|until| now >= until) || (bypass && !inner.bypass_used)
            }
            CircuitState::HalfOpen => !inner.trial_in_flight || (bypass && !inner.bypass_used),
        }
    }

    /// Admit a request or fail fast.
    pub fn try_acquire_at(self: &Arc<Self>, bypass: bool, now: Instant) -> Option<CircuitPermit> {
        let mut inner = self.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                if inner.open_until.is_some_and(|until| now >= until) {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else if bypass && !inner.bypass_used {
                    inner.bypass_used = true;
                    Admission::Bypass
                } else {
                    return None;
                }
            }
            CircuitState::HalfOpen => {
                if !inner.trial_in_flight {
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else if bypass && !inner.bypass_used {
                    inner.bypass_used = true;
                    Admission::Bypass
                } else {
                    return None;
                }
            }
        };
        drop(inner);

        if admission == Admission::Bypass {
            tracing::info!(
                instance = %self.instance_id,
                class = %self.class,
                "Critical bypass probe admitted through open circuit"
            );
        }

        Some(CircuitPermit {
            breaker: self.clone(),
            admission,
            settled: false,
        })
    }

    fn on_success(&self, admission: Admission, now: Instant) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Normal) => inner.failures.clear(),
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed, now);
            }
            // A successful crisis probe is evidence of recovery.
            (CircuitState::Open | CircuitState::HalfOpen, Admission::Bypass) => {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
            // Late outcomes from an earlier state are ignored.
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission, now: Instant) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Normal) => {
                let window = self.settings.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                if inner.failures.len() >= self.settings.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open, now);
            }
            // Bypass failures and late outcomes leave state and cooldown alone.
            _ => {}
        }
    }

    fn release(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;
        inner.bypass_used = false;
        match to {
            CircuitState::Open => {
                inner.open_until = Some(now + self.settings.cooldown);
                inner.failures.clear();
                inner.trial_in_flight = false;
                tracing::warn!(
                    instance = %self.instance_id,
                    class = %self.class,
                    cooldown = ?self.settings.cooldown,
                    from = from.as_str(),
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(instance = %self.instance_id, class = %self.class, "Circuit half-open, admitting trial");
            }
            CircuitState::Closed => {
                inner.open_until = None;
                inner.failures.clear();
                inner.trial_in_flight = false;
                tracing::info!(instance = %self.instance_id, class = %self.class, from = from.as_str(), "Circuit closed");
            }
        }
        metrics::record_circuit_transition(&self.instance_id, self.class, to);
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failures: inner.failures.len(),
            last_transition: inner.last_transition,
            open_until: inner.open_until,
        }
    }
}

/// Permission to send one request through a breaker.
///
/// The outcome must be reported with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]; dropping it unsettled counts as cancellation.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(self) {
        self.success_at(Instant::now());
    }

    pub fn failure(self) {
        self.failure_at(Instant::now());
    }

    pub fn success_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_success(self.admission, now);
    }

    pub fn failure_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.admission, now);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

/// Registry of circuit breakers keyed by (instance id, class).
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<(String, PriorityClass), Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for an instance and class.
    pub fn get_or_create(&self, instance_id: &str, class: PriorityClass) -> Arc<CircuitBreaker> {
        let key = (instance_id.to_string(), class);
        if let Some(breaker) = self.breakers.get(&key) {
            return breaker.clone();
        }
        self.breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    instance_id,
                    class,
                    BreakerSettings::for_class(&self.config, class),
                ))
            })
            .clone()
    }

    pub fn is_routable(&self, instance_id: &str, class: PriorityClass, bypass: bool) -> bool {
        self.is_routable_at(instance_id, class, bypass, Instant::now())
    }

    pub fn is_routable_at(&self, instance_id: &str, class: PriorityClass, bypass: bool, now: Instant) -> bool {
        match self.breakers.get(&(instance_id.to_string(), class)) {
            Some(breaker) => breaker.is_routable_at(bypass, now),
            None => true,
        }
    }

    pub fn acquire(&self, instance_id: &str, class: PriorityClass, bypass: bool) -> Result<CircuitPermit, GatewayError> {
        self.acquire_at(instance_id, class, bypass, Instant::now())
    }

    pub fn acquire_at(
        &self,
        instance_id: &str,
        class: PriorityClass,
        bypass: bool,
        now: Instant,
    ) -> Result<CircuitPermit, GatewayError> {
        self.get_or_create(instance_id, class)
            .try_acquire_at(bypass, now)
            .ok_or_else(|| GatewayError::CircuitOpen(instance_id.to_string()))
    }

    /// Current state; instances never seen are closed.
    pub fn state(&self, instance_id: &str, class: PriorityClass) -> CircuitState {
        self.breakers
            .get(&(instance_id.to_string(), class))
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, instance_id: &str, class: PriorityClass) -> Option<CircuitSnapshot> {
        self.breakers
            .get(&(instance_id.to_string(), class))
            .map(|b| b.snapshot())
    }
}
