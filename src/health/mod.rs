//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each cached instance at its declared health path
//!     → Adjust the instance's health score
//!
//! Passive health checks (passive.rs):
//!     Attempt outcome observed by the service router
//!     → Reward or penalise the health score
//!     → Fold latency into the response-time average
//! ```
//!
//! # Design Decisions
//! - Active and passive checks feed the same score in [0, 1]
//! - The score biases selection; the 0.30 floor excludes instances outright
//! - Health state is per-instance and lives on the shadow copy

pub mod active;
pub mod passive;

pub use active::HealthMonitor;
pub use passive::PassiveHealth;
