//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceRegistry (static config or HTTP registry)
//!     → cache.rs (30s shadow cache, stale-on-error)
//!     → merge into shadow copies (connection counts and health survive)
//!     → candidates handed to the service router
//!
//! Background:
//!     refresher ticks → refresh every known service
//! ```
//!
//! # Design Decisions
//! - The registry is the source of truth for membership only; health and
//!   load live on the local shadow copies
//! - A registry outage never fails a request that has cached data

pub mod cache;
pub mod registry;

pub use cache::ServiceCache;
pub use registry::{HttpRegistry, ServiceDescriptor, ServiceRegistry, StaticRegistry};
