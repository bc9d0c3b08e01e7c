//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → router.rs (route table lookup, rewrite)
//!     → matcher.rs (exact / prefix / regex evaluation)
//!     → RouteMatch { service, default priority, websocket, upstream path }
//!
//! Logical service
//!     → service_router.rs (cache → breakers → load balancer → retries)
//!     → admitted backend instance
//! ```
//!
//! # Design Decisions
//! - Route tables are immutable once built; reloads swap the whole table
//! - Deterministic: same input always matches same route
//! - Longest literal prefix wins, ties by registration order

pub mod matcher;
pub mod router;
pub mod service_router;

pub use router::{RegisterOutcome, RouteMatch, RouteTable};
pub use service_router::{Routed, ServiceRouter, ServiceSnapshot, Target};
