//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → route table swapped atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only route rules hot-reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AdminConfig, BreakerClassConfig, CircuitBreakerConfig, ClassTimeouts, ConnectionKind,
    GatewayConfig, HealthCheckConfig, InstanceConfig, ListenerConfig, LoadBalancerConfig,
    LogFormat, MatchKind, ObservabilityConfig, RegistryConfig, RegistryKind, RetryConfig,
    RouteConfig, ServiceConfig, StrategyKind, TimeoutConfig, WebSocketConfig,
};
