//! Service gateway library.
//!
//! Routes inbound HTTP and WebSocket traffic to logical backend services,
//! with load balancing, circuit breaking, retries and connection quotas.

pub mod admin;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod websocket;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
