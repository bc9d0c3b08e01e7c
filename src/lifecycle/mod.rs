//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → HTTP listener stops accepting
//!             → background tasks exit (refresher, health, sweeper, admin)
//!             → open WebSocket connections closed with 1001
//!             → drain waits for subscribers, bounded by a timeout
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
