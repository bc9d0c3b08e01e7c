//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, route lookup, forwarding)
//!     → request.rs (correlation ID, request context, upstream request)
//!     → [ServiceRouter picks instance, retries, breaker]
//!     → response.rs (error envelope, hooks, headers)
//!     → Send to client
//!
//! Upgrade requests:
//!     server.rs → websocket.rs (admit, upgrade) → WebSocketProxy
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use response::{ErrorResponse, ResponseHook};
pub use server::{AppState, HttpServer, ServerError};
