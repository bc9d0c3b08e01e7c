//! Admin surface.
//!
//! # Responsibilities
//! - Expose per-service health, breaker state and connection counts
//! - Expose WebSocket connection statistics and broadcast
//!
//! # Design Decisions
//! - Served on its own listener, never on the proxy port
//! - Every route sits behind bearer-token auth

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::config::AdminConfig;
use crate::http::server::AppState;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub app: AppState,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(app: &AppState, config: &AdminConfig) -> Router {
    let state = AdminState {
        app: app.clone(),
        api_key: Arc::from(config.api_key.as_str()),
    };

    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(get_services))
        .route("/admin/services/{name}", get(get_service))
        .route("/admin/routes", get(get_routes))
        .route("/admin/connections", get(get_connections))
        .route("/admin/connections/broadcast", post(broadcast))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
