//! Registry clients.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{InstanceConfig, ServiceConfig};
use crate::error::GatewayError;

/// Descriptor consumed from the registry: `{id, address, weight, declared_health_check_path}`.
pub type ServiceDescriptor = InstanceConfig;

/// Source of truth for which instances exist.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Fetch the current instances of a service.
    async fn instances(&self, service: &str) -> Result<Vec<ServiceDescriptor>, GatewayError>;
}

/// Registry backed by configuration, mutable at runtime.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Vec<ServiceDescriptor>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        for service in services {
            registry.set_instances(&service.name, service.instances.clone());
        }
        registry
    }

    /// Replace the instance list of a service.
    pub fn set_instances(&self, service: &str, instances: Vec<ServiceDescriptor>) {
        self.services
            .write()
            .expect("static registry lock poisoned")
            .insert(service.to_string(), instances);
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .expect("static registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn instances(&self, service: &str) -> Result<Vec<ServiceDescriptor>, GatewayError> {
        Ok(self
            .services
            .read()
            .expect("static registry lock poisoned")
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}

/// Registry reached over HTTP: `GET {base}/services/{name}` → `[descriptor]`.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: url::Url,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| GatewayError::Registry(format!("invalid registry url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Registry(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn service_url(&self, service: &str) -> Result<url::Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Registry("registry url cannot be a base".into()))?
            .pop_if_empty()
            .push("services")
            .push(service);
        Ok(url)
    }
}

#[async_trait]
impl ServiceRegistry for HttpRegistry {
    async fn instances(&self, service: &str) -> Result<Vec<ServiceDescriptor>, GatewayError> {
        let url = self.service_url(service)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Registry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Registry(format!(
                "registry returned {} for '{}'",
                response.status(),
                service
            )));
        }

        response
            .json::<Vec<ServiceDescriptor>>()
            .await
            .map_err(|e| GatewayError::Registry(e.to_string()))
    }
}
