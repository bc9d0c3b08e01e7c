//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::PriorityClass;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Route rules mapping paths to logical services.
    pub routes: Vec<RouteConfig>,

    /// Statically known services (used by the static registry).
    pub services: Vec<ServiceConfig>,

    /// Registry source and shadow cache settings.
    pub registry: RegistryConfig,

    /// Instance selection settings.
    pub load_balancer: LoadBalancerConfig,

    /// Per-class circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-class retry settings.
    pub retries: RetryConfig,

    /// Per-class timeouts.
    pub timeouts: TimeoutConfig,

    /// WebSocket admission and idle settings.
    pub websocket: WebSocketConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin surface settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum buffered request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// How a route's path pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    #[default]
    Prefix,
    Regex,
}

/// Idle-timeout class of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    #[default]
    Chat,
    Session,
    Monitoring,
}

impl std::str::FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ConnectionKind::Chat),
            "session" => Ok(ConnectionKind::Session),
            "monitoring" => Ok(ConnectionKind::Monitoring),
            other => Err(format!("unknown connection kind '{}'", other)),
        }
    }
}

/// Route rule mapping a path pattern to a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Path pattern (literal for exact/prefix, regex otherwise).
    pub path: String,

    /// Pattern interpretation.
    #[serde(default, rename = "match")]
    pub match_kind: MatchKind,

    /// Logical service to forward to.
    pub service: String,

    /// Optional path rewrite.
    #[serde(default)]
    pub rewrite: Option<String>,

    /// Priority class when the request carries none.
    #[serde(default)]
    pub priority: PriorityClass,

    /// Whether the route accepts WebSocket upgrades.
    #[serde(default)]
    pub websocket: bool,

    /// Idle-timeout class for WebSocket connections on this route.
    #[serde(default)]
    pub connection_kind: ConnectionKind,
}

/// A logical service and its statically known instances.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Service descriptor: `{id, address, weight, declared_health_check_path}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Unique instance identifier.
    pub id: String,

    /// Instance address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Static weight for weighted selection (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Path probed by active health checks.
    #[serde(default = "default_health_path", alias = "declared_health_check_path")]
    pub health_check_path: String,
}

fn default_weight() -> u32 {
    1
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Where instance lists come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    #[default]
    Static,
    Http,
}

/// Registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: RegistryKind,

    /// Base URL of an HTTP registry.
    pub url: Option<String>,

    /// Shadow cache TTL in seconds.
    pub cache_ttl_secs: u64,

    /// Background refresh interval in seconds.
    pub refresh_interval_secs: u64,

    /// Registry request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Static,
            url: None,
            cache_ttl_secs: 30,
            refresh_interval_secs: 15,
            timeout_secs: 2,
        }
    }
}

/// Selection strategy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    HealthWeighted,
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: StrategyKind,

    /// Wrap the strategy with priority boosting.
    pub priority_boost: bool,

    /// Instances below this health score are filtered out.
    pub health_floor: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            priority_boost: false,
            health_floor: 0.30,
        }
    }
}

/// Breaker thresholds for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakerClassConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Open-state cooldown in seconds.
    pub cooldown_secs: u64,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub normal: BreakerClassConfig,
    pub elevated: BreakerClassConfig,
    pub critical: BreakerClassConfig,

    /// Rolling failure window in seconds.
    pub window_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn for_class(&self, class: PriorityClass) -> BreakerClassConfig {
        match class {
            PriorityClass::Normal => self.normal,
            PriorityClass::Elevated => self.elevated,
            PriorityClass::Critical => self.critical,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            normal: BreakerClassConfig { failure_threshold: 5, cooldown_secs: 60 },
            elevated: BreakerClassConfig { failure_threshold: 5, cooldown_secs: 60 },
            critical: BreakerClassConfig { failure_threshold: 3, cooldown_secs: 30 },
            window_secs: 60,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt ceilings per class.
    pub normal_max_attempts: u32,
    pub elevated_max_attempts: u32,
    pub critical_max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            normal_max_attempts: 3,
            elevated_max_attempts: 5,
            critical_max_attempts: 10,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter: true,
        }
    }
}

/// Timeouts for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClassTimeouts {
    /// Per-attempt backend call timeout in milliseconds.
    pub attempt_ms: u64,
    /// Outer request deadline in milliseconds.
    pub deadline_ms: u64,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub normal: ClassTimeouts,
    pub elevated: ClassTimeouts,
    pub critical: ClassTimeouts,
}

impl TimeoutConfig {
    pub fn for_class(&self, class: PriorityClass) -> ClassTimeouts {
        match class {
            PriorityClass::Normal => self.normal,
            PriorityClass::Elevated => self.elevated,
            PriorityClass::Critical => self.critical,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            normal: ClassTimeouts { attempt_ms: 5_000, deadline_ms: 15_000 },
            elevated: ClassTimeouts { attempt_ms: 8_000, deadline_ms: 25_000 },
            critical: ClassTimeouts { attempt_ms: 15_000, deadline_ms: 60_000 },
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Global connection ceiling.
    pub max_connections: usize,

    /// Per-user connection ceiling.
    pub max_connections_per_user: usize,

    /// Idle timeouts per connection kind, in seconds.
    pub chat_idle_secs: u64,
    pub session_idle_secs: u64,
    pub monitoring_idle_secs: u64,

    /// Idle sweep interval in seconds.
    pub sweep_interval_secs: u64,

    /// Per-direction relay queue depth.
    pub buffer_size: usize,

    /// Backend connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl WebSocketConfig {
    pub fn idle_timeout(&self, kind: ConnectionKind) -> Duration {
        let secs = match kind {
            ConnectionKind::Chat => self.chat_idle_secs,
            ConnectionKind::Session => self.session_idle_secs,
            ConnectionKind::Monitoring => self.monitoring_idle_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_user: 5,
            chat_idle_secs: 5 * 60,
            session_idle_secs: 30 * 60,
            monitoring_idle_secs: 60 * 60,
            sweep_interval_secs: 30,
            buffer_size: 256,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Score added on a successful attempt or probe.
    pub success_reward: f64,

    /// Score removed on a failed attempt or probe.
    pub failure_penalty: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            success_reward: 0.05,
            failure_penalty: 0.15,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
