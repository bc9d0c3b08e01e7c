//! Backend instance shadow copy.
//!
//! # Responsibilities
//! - Represent a single backend instance of a logical service
//! - Track active connections (for least-connections selection)
//! - Track a health score in [0, 1] and a rolling response-time average
//!
//! All mutable fields are atomics so concurrent routing decisions never
//! corrupt counters.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::InstanceConfig;

/// Weight of the newest sample in the response-time average.
const LATENCY_ALPHA: f64 = 0.2;

/// A single backend instance.
#[derive(Debug)]
pub struct ServiceInstance {
    /// Instance identity, unique within a service.
    pub id: String,
    /// Network address ("host:port").
    pub address: String,
    /// Static weight for weighted selection.
    pub weight: u32,
    /// Path probed by active health checks.
    pub health_check_path: String,

    /// Health score stored as f64 bits.
    health: AtomicU64,
    /// Number of in-flight requests or bound connections.
    active_connections: AtomicUsize,
    /// Rolling average response time in ms, stored as f64 bits.
    avg_response_ms: AtomicU64,
    /// Number of latency samples folded in.
    samples: AtomicU64,
}

impl ServiceInstance {
    /// Create a new, fully healthy instance.
    pub fn new(id: impl Into<String>, address: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight,
            health_check_path: "/health".to_string(),
            health: AtomicU64::new(1.0f64.to_bits()),
            active_connections: AtomicUsize::new(0),
            avg_response_ms: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
        }
    }

    /// Create an instance from a service descriptor.
    pub fn from_descriptor(descriptor: &InstanceConfig) -> Self {
        Self::new(&descriptor.id, &descriptor.address, descriptor.weight)
            .with_health_check_path(descriptor.health_check_path.clone())
    }

    /// Set the health check path.
    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    /// Whether this instance was built from the same descriptor.
    pub fn matches_descriptor(&self, descriptor: &InstanceConfig) -> bool {
        self.id == descriptor.id
            && self.address == descriptor.address
            && self.weight == descriptor.weight
            && self.health_check_path == descriptor.health_check_path
    }

    /// Copy health and latency state from a previous shadow copy.
    pub fn inherit_state(&self, previous: &ServiceInstance) {
        self.set_health(previous.health_score());
        self.avg_response_ms
            .store(previous.avg_response_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        self.samples
            .store(previous.samples.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    // --- Connections ---

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment active connection count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connection count, saturating at zero.
    pub fn dec_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Increment the connection count and return a guard that undoes it.
    pub fn acquire(self: &Arc<Self>) -> InstanceGuard {
        self.inc_connections();
        InstanceGuard {
            instance: self.clone(),
        }
    }

    // --- Health ---

    pub fn health_score(&self) -> f64 {
        f64::from_bits(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health(&self, score: f64) {
        self.health
            .store(score.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Atomically add `delta` to the health score, clamped to [0, 1].
    pub fn adjust_health(&self, delta: f64) -> f64 {
        let previous = self
            .health
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).clamp(0.0, 1.0).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        (f64::from_bits(previous) + delta).clamp(0.0, 1.0)
    }

    // --- Latency ---

    /// Fold a response time into the rolling average.
    pub fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let first = self.samples.fetch_add(1, Ordering::Relaxed) == 0;
        let _ = self
            .avg_response_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = if first {
                    sample
                } else {
                    f64::from_bits(bits) * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA
                };
                Some(avg.to_bits())
            });
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        f64::from_bits(self.avg_response_ms.load(Ordering::Relaxed))
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct InstanceGuard {
    instance: Arc<ServiceInstance>,
}

impl InstanceGuard {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Deref for InstanceGuard {
    type Target = ServiceInstance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.instance.dec_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_connection() {
        let instance = Arc::new(ServiceInstance::new("i1", "127.0.0.1:8080", 1));
        let g1 = instance.acquire();
        let g2 = instance.acquire();
        assert_eq!(instance.active_connections(), 2);
        drop(g1);
        assert_eq!(instance.active_connections(), 1);
        drop(g2);
        assert_eq!(instance.active_connections(), 0);

        // Never underflows
        instance.dec_connections();
        assert_eq!(instance.active_connections(), 0);
    }

    #[test]
    fn test_health_clamped() {
        let instance = ServiceInstance::new("i1", "127.0.0.1:8080", 1);
        assert_eq!(instance.health_score(), 1.0);
        assert_eq!(instance.adjust_health(0.5), 1.0);
        let after = instance.adjust_health(-0.25);
        assert!((after - 0.75).abs() < 1e-9);
        instance.adjust_health(-5.0);
        assert_eq!(instance.health_score(), 0.0);
    }

    #[test]
    fn test_latency_average() {
        let instance = ServiceInstance::new("i1", "127.0.0.1:8080", 1);
        instance.record_latency(Duration::from_millis(100));
        assert!((instance.avg_response_time_ms() - 100.0).abs() < 1e-6);
        instance.record_latency(Duration::from_millis(200));
        assert!((instance.avg_response_time_ms() - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_concurrent_counters() {
        let instance = Arc::new(ServiceInstance::new("i1", "127.0.0.1:8080", 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let instance = instance.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = instance.acquire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(instance.active_connections(), 0);
    }
}
