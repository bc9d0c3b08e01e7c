//! WebSocket upgrade handling.
//!
//! # Responsibilities
//! - Admit the connection before completing the handshake
//! - Complete the upgrade and bridge the Axum socket to relay frames
//! - Hand the connection to the WebSocket proxy for binding and relay
//!
//! # Data Flow
//! ```text
//! Client ──► reader task ──► in_tx ──► WebSocketProxy::run ──► backend
//! Client ◄── writer task ◄── out_rx ◄── Connection::outbound ◄── backend / manager
//! ```
//!
//! # Design Decisions
//! - Quota rejection happens before the upgrade, so it is a plain 429 envelope
//! - Protocol ping/pong counts as activity but never reaches the relay

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::config::{ConnectionKind, RouteConfig};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::http::request::{context_headers, query_param, session_id, upstream_path_and_query};
use crate::http::response::ErrorResponse;
use crate::http::server::AppState;
use crate::websocket::proxy::BackendRequest;
use crate::websocket::{CloseReason, Connection, ConnectionRequest, Frame, WebSocketProxy};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Admit, then upgrade. Rejections are answered before the handshake.
pub fn handle_upgrade(
    state: AppState,
    upgrade: WebSocketUpgrade,
    parts: Parts,
    route: Arc<RouteConfig>,
    upstream_path: String,
    ctx: RequestContext,
    peer: Option<SocketAddr>,
) -> Response {
    let kind = match query_param(&parts.uri, "kind") {
        Some(kind) => match kind.parse::<ConnectionKind>() {
            Ok(kind) => kind,
            Err(e) => {
                return ErrorResponse::new(GatewayError::BadRequest(e), ctx.correlation_id())
                    .into_response()
            }
        },
        None => route.connection_kind,
    };

    let request = ConnectionRequest {
        user_id: ctx
            .auth()
            .user_id
            .clone()
            .unwrap_or_else(|| "anonymous".to_string()),
        session_id: session_id(&parts.headers, &parts.uri),
        service: route.service.clone(),
        class: ctx.priority(),
        kind,
    };

    let manager = state.connections().clone();
    let buffer = manager.config().buffer_size.max(1);
    let (out_tx, out_rx) = mpsc::channel(buffer);
    let connection = match manager.admit(request, out_tx) {
        Ok(connection) => connection,
        Err(e) => return ErrorResponse::new(e, ctx.correlation_id()).into_response(),
    };

    let backend = BackendRequest {
        path: upstream_path_and_query(&upstream_path, &parts.uri),
        headers: backend_headers(&ctx, peer),
    };

    let failed_id = connection.id;
    let proxy = state.ws_proxy.clone();
    upgrade
        .on_failed_upgrade(move |e| {
            tracing::warn!(connection_id = %failed_id, error = %e, "WebSocket upgrade failed");
            manager.deregister(failed_id);
        })
        .on_upgrade(move |socket| serve_socket(proxy, connection, ctx, backend, socket, out_rx, buffer))
}

fn backend_headers(ctx: &RequestContext, peer: Option<SocketAddr>) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = context_headers(ctx, peer)
        .into_iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();
    if let Some(auth) = ctx.auth().authorization.as_deref() {
        headers.push(("authorization".to_string(), auth.to_string()));
    }
    headers
}

async fn serve_socket(
    proxy: Arc<WebSocketProxy>,
    connection: Arc<Connection>,
    ctx: RequestContext,
    backend: BackendRequest,
    socket: WebSocket,
    mut out_rx: mpsc::Receiver<Frame>,
    buffer: usize,
) {
    let (mut sink, mut stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Frame>(buffer);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, Frame::Close(_));
            if sink.send(to_message(frame)).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_conn = connection.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let Some(frame) = from_message(message) else {
                reader_conn.touch();
                continue;
            };
            let closing = matches!(frame, Frame::Close(_));
            if in_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    let id = connection.id;
    proxy.run(connection, ctx, backend, in_rx).await;

    reader.abort();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!(connection_id = %id, "WebSocket writer did not drain in time");
    }
}

/// Convert a relay frame to an Axum message.
pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

/// Convert an Axum message to a relay frame; ping and pong yield `None`.
pub fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Close(frame) => Some(Frame::Close(
            frame.map(|f| CloseReason::new(f.code, f.reason.to_string())),
        )),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AuthContext, Deadline, PriorityClass};
    use crate::websocket::CLOSE_BACKEND_UNAVAILABLE;

    #[test]
    fn test_close_frame_conversion() {
        let message = to_message(Frame::Close(Some(CloseReason::new(CLOSE_BACKEND_UNAVAILABLE, "backend unavailable"))));
        match &message {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CLOSE_BACKEND_UNAVAILABLE);
                assert_eq!(frame.reason.as_str(), "backend unavailable");
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(
            from_message(message),
            Some(Frame::Close(Some(CloseReason::new(1011, "backend unavailable"))))
        );
    }

    #[test]
    fn test_ping_not_relayed() {
        assert_eq!(from_message(Message::Ping(vec![1u8].into())), None);
        assert_eq!(from_message(Message::Text("hi".into())), Some(Frame::Text("hi".into())));
    }

    #[test]
    fn test_backend_headers_carry_identity() {
        let auth = AuthContext {
            authorization: Some("Bearer t".into()),
            user_id: Some("alice".into()),
        };
        let ctx = RequestContext::new(
            Some("corr-9".into()),
            auth,
            PriorityClass::Elevated,
            false,
            Deadline::after(Duration::from_secs(1)),
        );
        let headers = backend_headers(&ctx, None);
        assert!(headers.contains(&("x-correlation-id".into(), "corr-9".into())));
        assert!(headers.contains(&("x-priority-class".into(), "elevated".into())));
        assert!(headers.contains(&("x-user-id".into(), "alice".into())));
        assert!(headers.contains(&("authorization".into(), "Bearer t".into())));
    }
}
