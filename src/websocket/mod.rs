//! WebSocket connection management and proxying.
//!
//! # Data Flow
//! ```text
//! Client handshake (http/websocket.rs)
//!     → manager.rs admit (global + per-user quota, one atomic step)
//!     → proxy.rs bind (ServiceRouter → BackendConnector)
//!     → relay loop
//!         client → control.rs (ping / session_bind answered locally) → backend
//!         backend → client
//!     → on close/failure: one re-bind, then close 1011 and deregister
//!
//! Background:
//!     manager.rs sweeper → close idle connections (1001)
//! ```
//!
//! # Design Decisions
//! - Frames are library-neutral so the relay is testable without sockets
//! - Each direction is FIFO through a bounded channel
//! - Tearing down the relay drops both channels, which ends both socket tasks

pub mod control;
pub mod manager;
pub mod proxy;

pub use manager::{
    BroadcastFilter, Connection, ConnectionId, ConnectionManager, ConnectionRequest, ConnectionStats,
};
pub use proxy::{BackendConnector, BackendLink, TungsteniteConnector, WebSocketProxy};

/// Endpoint going away; used for idle eviction and shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The backend could not be (re)bound. Not 1014: tungstenite rejects it.
pub const CLOSE_BACKEND_UNAVAILABLE: u16 = 1011;

/// Close code and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A data or close frame, independent of the WebSocket library.
///
/// Protocol-level ping/pong is answered by the socket libraries and never
/// crosses the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseReason>),
}
