//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every cached instance
//! - Feed probe outcomes into the instance health score

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::discovery::ServiceCache;
use crate::health::passive::PassiveHealth;
use crate::load_balancer::ServiceInstance;
use crate::observability::metrics;

pub struct HealthMonitor {
    cache: Arc<ServiceCache>,
    config: HealthCheckConfig,
    scoring: PassiveHealth,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(cache: Arc<ServiceCache>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let scoring = PassiveHealth::from_config(&config);

        Self {
            cache,
            config,
            scoring,
            client,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(interval = self.config.interval_secs, "Health monitor starting");

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every cached instance once.
    pub async fn check_all(&self) {
        for (service, instance) in self.cache.all_instances() {
            let started = Instant::now();
            let healthy = self.probe(&instance).await;

            let score = if healthy {
                self.scoring.on_success(&instance, Some(started.elapsed()))
            } else {
                self.scoring.on_failure(&instance)
            };
            metrics::record_instance_health(&service, &instance.id, score);
        }
    }

    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let uri = format!("http://{}{}", instance.address, instance.health_check_path);

        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "service-gateway-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(instance = %instance.id, error = %e, "Failed to build health check request");
                return false;
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::warn!(instance = %instance.id, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::warn!(instance = %instance.id, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(instance = %instance.id, "Health check failed: timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ServiceDescriptor, StaticRegistry};

    #[tokio::test]
    async fn test_unreachable_instance_is_penalised() {
        let registry = StaticRegistry::new();
        registry.set_instances(
            "svc",
            vec![ServiceDescriptor {
                id: "dead".into(),
                // reserved port, nothing listens
                address: "127.0.0.1:1".into(),
                weight: 1,
                health_check_path: "/health".into(),
            }],
        );
        let cache = Arc::new(ServiceCache::new(Arc::new(registry), Duration::from_secs(30)));
        let instances = cache.candidates("svc").await.unwrap();

        let config = HealthCheckConfig {
            timeout_secs: 1,
            ..HealthCheckConfig::default()
        };
        let monitor = HealthMonitor::new(cache, config);
        monitor.check_all().await;

        assert!(instances[0].health_score() < 1.0);
    }

    #[tokio::test]
    async fn test_zero_interval_does_not_panic() {
        let cache = Arc::new(ServiceCache::new(Arc::new(StaticRegistry::new()), Duration::from_secs(30)));
        let config = HealthCheckConfig {
            enabled: true,
            interval_secs: 0,
            ..HealthCheckConfig::default()
        };
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(HealthMonitor::new(cache, config).run(rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
