//! End-to-end WebSocket admission and relay tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use service_gateway::config::RouteConfig;
use service_gateway::GatewayConfig;

mod common;

fn ws_route(path: &str, service: &str) -> RouteConfig {
    RouteConfig {
        websocket: true,
        ..common::route(path, service)
    }
}

async fn ws_config() -> (GatewayConfig, tokio::sync::mpsc::UnboundedReceiver<()>) {
    let (backend, accepted) = common::start_ws_echo_backend().await;
    let mut config = common::test_config();
    config.routes.push(ws_route("/ws", "echo"));
    config.services.push(common::service("echo", &[backend]));
    (config, accepted)
}

async fn next_message<S>(ws: &mut S) -> Message
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("websocket error")
}

#[tokio::test]
async fn test_relay_and_local_ping() {
    let (config, mut accepted) = ws_config().await;
    let gateway = common::start_gateway(config).await;

    let mut request = gateway.ws_url("/ws?kind=chat").into_client_request().unwrap();
    request.headers_mut().insert("x-user-id", "alice".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_message(&mut ws).await.to_text().unwrap(), "hello");
    assert!(accepted.recv().await.is_some());

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_message(&mut ws).await.to_text().unwrap(), r#"{"type":"pong"}"#);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_per_user_limit_rejected_before_upgrade() {
    let (mut config, _accepted) = ws_config().await;
    config.websocket.max_connections_per_user = 1;
    let gateway = common::start_gateway(config).await;

    let connect = || {
        let mut request = gateway.ws_url("/ws").into_client_request().unwrap();
        request.headers_mut().insert("x-user-id", "bob".parse().unwrap());
        connect_async(request)
    };

    let (_first, _) = connect().await.unwrap();
    match connect().await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 429),
        other => panic!("expected 429 rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unreachable_backend_closes_as_unavailable() {
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = common::test_config();
    config.routes.push(ws_route("/ws", "dead"));
    config.services.push(common::service("dead", &[dead]));
    config.websocket.connect_timeout_ms = 200;
    let gateway = common::start_gateway(config).await;

    let (mut ws, _) = connect_async(gateway.ws_url("/ws")).await.unwrap();
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("expected close frame, got {:?}", other),
    }
}
