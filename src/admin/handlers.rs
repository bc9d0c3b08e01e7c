use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::AdminState;
use crate::config::RouteConfig;
use crate::routing::ServiceSnapshot;
use crate::websocket::{BroadcastFilter, ConnectionStats, Frame};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub routes: usize,
    pub services: usize,
    pub websocket_connections: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        routes: state.app.routes.load().len(),
        services: state.app.router.cache().services().len(),
        websocket_connections: state.app.connections().len(),
    })
}

pub async fn get_services(State(state): State<AdminState>) -> Json<Vec<ServiceSnapshot>> {
    Json(state.app.router.snapshots())
}

pub async fn get_service(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceSnapshot>, StatusCode> {
    state
        .app
        .router
        .service_snapshot(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn get_routes(State(state): State<AdminState>) -> Json<Vec<RouteConfig>> {
    Json(state.app.routes.load().routes().cloned().collect())
}

pub async fn get_connections(State(state): State<AdminState>) -> Json<ConnectionStats> {
    Json(state.app.connections().stats())
}

/// Broadcast target; at most one selector may be set.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub service: Option<String>,
    pub message: String,
}

#[derive(Serialize)]
pub struct BroadcastResult {
    pub delivered: usize,
}

pub async fn broadcast(
    State(state): State<AdminState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResult>, StatusCode> {
    let filter = match (request.user_id, request.session_id, request.service) {
        (None, None, None) => BroadcastFilter::All,
        (Some(user), None, None) => BroadcastFilter::User(user),
        (None, Some(session), None) => BroadcastFilter::Session(session),
        (None, None, Some(service)) => BroadcastFilter::Service(service),
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    let delivered = state
        .app
        .connections()
        .broadcast(&filter, Frame::Text(request.message));
    tracing::info!(filter = ?filter, delivered = delivered, "Admin broadcast");
    Ok(Json(BroadcastResult { delivered }))
}
