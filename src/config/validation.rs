//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference known services)
//! - Validate value ranges (thresholds > 0, deadlines >= attempt timeouts)
//! - Reject regex patterns that do not compile
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{GatewayConfig, MatchKind, RegistryKind};
use crate::context::PriorityClass;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("route '{path}' targets unknown service '{service}'")]
    UnknownService { path: String, service: String },

    #[error("route '{path}' has an invalid regex: {reason}")]
    InvalidRegex { path: String, reason: String },

    #[error("route path '{0}' must start with '/'")]
    InvalidPath(String),

    #[error("service '{service}' declares instance '{id}' more than once")]
    DuplicateInstance { service: String, id: String },

    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("instance '{id}' has zero weight")]
    ZeroWeight { id: String },

    #[error("{class} circuit breaker threshold must be greater than zero")]
    ZeroThreshold { class: PriorityClass },

    #[error("{class} max attempts must be greater than zero")]
    ZeroAttempts { class: PriorityClass },

    #[error("{class} deadline must be at least the attempt timeout")]
    DeadlineBelowAttempt { class: PriorityClass },

    #[error("health floor {0} is outside [0, 1]")]
    HealthFloor(String),

    #[error("websocket quotas must be greater than zero")]
    ZeroQuota,

    #[error("http registry requires registry.url")]
    MissingRegistryUrl,
}

/// Validate the configuration, collecting every error.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut services = HashSet::new();
    for service in &config.services {
        if !services.insert(service.name.as_str()) {
            errors.push(ValidationError::DuplicateService(service.name.clone()));
        }
        let mut ids = HashSet::new();
        for instance in &service.instances {
            if !ids.insert(instance.id.as_str()) {
                errors.push(ValidationError::DuplicateInstance {
                    service: service.name.clone(),
                    id: instance.id.clone(),
                });
            }
            if instance.weight == 0 {
                errors.push(ValidationError::ZeroWeight { id: instance.id.clone() });
            }
        }
    }

    for route in &config.routes {
        match route.match_kind {
            MatchKind::Regex => {
                if let Err(e) = regex::Regex::new(&route.path) {
                    errors.push(ValidationError::InvalidRegex {
                        path: route.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            MatchKind::Exact | MatchKind::Prefix => {
                if !route.path.starts_with('/') {
                    errors.push(ValidationError::InvalidPath(route.path.clone()));
                }
            }
        }

        // Services served by a dynamic registry are unknown until runtime.
        if config.registry.kind == RegistryKind::Static && !services.contains(route.service.as_str()) {
            errors.push(ValidationError::UnknownService {
                path: route.path.clone(),
                service: route.service.clone(),
            });
        }
    }

    if config.registry.kind == RegistryKind::Http && config.registry.url.is_none() {
        errors.push(ValidationError::MissingRegistryUrl);
    }

    for class in PriorityClass::ALL {
        if config.circuit_breaker.for_class(class).failure_threshold == 0 {
            errors.push(ValidationError::ZeroThreshold { class });
        }
        let attempts = match class {
            PriorityClass::Normal => config.retries.normal_max_attempts,
            PriorityClass::Elevated => config.retries.elevated_max_attempts,
            PriorityClass::Critical => config.retries.critical_max_attempts,
        };
        if attempts == 0 {
            errors.push(ValidationError::ZeroAttempts { class });
        }
        let timeouts = config.timeouts.for_class(class);
        if timeouts.deadline_ms < timeouts.attempt_ms {
            errors.push(ValidationError::DeadlineBelowAttempt { class });
        }
    }

    let floor = config.load_balancer.health_floor;
    if !(0.0..=1.0).contains(&floor) {
        errors.push(ValidationError::HealthFloor(floor.to_string()));
    }

    if config.websocket.max_connections == 0 || config.websocket.max_connections_per_user == 0 {
        errors.push(ValidationError::ZeroQuota);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
