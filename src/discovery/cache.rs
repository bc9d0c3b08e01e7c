//! Shadow cache of registry data.
//!
//! # Responsibilities
//! - Serve candidate lists for a service, refreshing after the TTL
//! - Fall back to stale entries when the registry is unreachable
//! - Keep shadow copies stable across refreshes so counters survive

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::discovery::registry::{ServiceDescriptor, ServiceRegistry};
use crate::error::GatewayError;
use crate::load_balancer::ServiceInstance;
use crate::observability::metrics;

/// Instances of one service as of one fetch.
pub type InstanceList = Arc<Vec<Arc<ServiceInstance>>>;

#[derive(Debug, Clone)]
struct CachedService {
    instances: InstanceList,
    fetched_at: Instant,
}

/// TTL cache in front of a [`ServiceRegistry`].
pub struct ServiceCache {
    registry: Arc<dyn ServiceRegistry>,
    ttl: Duration,
    entries: DashMap<String, CachedService>,
}

impl ServiceCache {
    pub fn new(registry: Arc<dyn ServiceRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Candidates for `service`, fetched from the registry when stale.
    pub async fn candidates(&self, service: &str) -> Result<InstanceList, GatewayError> {
        if let Some(entry) = self.entries.get(service) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.instances.clone());
            }
        }
        self.refresh(service).await
    }

    /// Fetch from the registry now; serve stale data if that fails.
    pub async fn refresh(&self, service: &str) -> Result<InstanceList, GatewayError> {
        match self.registry.instances(service).await {
            Ok(descriptors) => Ok(self.merge(service, descriptors)),
            Err(e) => match self.entries.get(service) {
                Some(entry) => {
                    tracing::warn!(
                        service = %service,
                        error = %e,
                        age = ?entry.fetched_at.elapsed(),
                        "Registry unavailable, serving stale instances"
                    );
                    metrics::record_registry_stale(service);
                    Ok(entry.instances.clone())
                }
                None => {
                    tracing::error!(service = %service, error = %e, "Registry unavailable and nothing cached");
                    Err(e)
                }
            },
        }
    }

    fn merge(&self, service: &str, descriptors: Vec<ServiceDescriptor>) -> InstanceList {
        let mut entry = self
            .entries
            .entry(service.to_string())
            .or_insert_with(|| CachedService {
                instances: Arc::new(Vec::new()),
                fetched_at: Instant::now(),
            });

        let merged: Vec<Arc<ServiceInstance>> = {
            let previous: HashMap<&str, &Arc<ServiceInstance>> =
                entry.instances.iter().map(|i| (i.id.as_str(), i)).collect();

            descriptors
                .iter()
                .map(|descriptor| match previous.get(descriptor.id.as_str()) {
                    Some(existing) if existing.matches_descriptor(descriptor) => Arc::clone(existing),
                    Some(existing) => {
                        let updated = ServiceInstance::from_descriptor(descriptor);
                        updated.inherit_state(existing);
                        Arc::new(updated)
                    }
                    None => Arc::new(ServiceInstance::from_descriptor(descriptor)),
                })
                .collect()
        };

        if merged.len() != entry.instances.len() {
            tracing::info!(
                service = %service,
                before = entry.instances.len(),
                after = merged.len(),
                "Service membership changed"
            );
        }

        entry.instances = Arc::new(merged);
        entry.fetched_at = Instant::now();
        entry.instances.clone()
    }

    /// Cached instances without touching the registry.
    pub fn cached(&self, service: &str) -> Option<InstanceList> {
        self.entries.get(service).map(|e| e.instances.clone())
    }

    /// Names of every service seen so far.
    pub fn services(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Every cached instance with its service name.
    pub fn all_instances(&self) -> Vec<(String, Arc<ServiceInstance>)> {
        self.entries
            .iter()
            .flat_map(|e| {
                let service = e.key().clone();
                e.instances
                    .iter()
                    .map(move |i| (service.clone(), i.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Refresh every known service until shutdown.
    pub async fn run_refresher(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?interval, "Registry refresher starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for service in self.services() {
                        let _ = self.refresh(&service).await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Registry refresher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
