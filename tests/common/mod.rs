//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use service_gateway::config::{InstanceConfig, RouteConfig, ServiceConfig};
use service_gateway::{GatewayConfig, HttpServer, Shutdown};

async fn bind_ephemeral() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move { (200, response.to_string()) }).await
}

/// Start a programmable mock backend with async support.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let (listener, addr) = bind_ephemeral().await;
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                // Drain the request head so the client sees a clean response.
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;

                let (status, body) = f().await;
                let status_text = match status {
                    200 => "200 OK",
                    404 => "404 Not Found",
                    500 => "500 Internal Server Error",
                    502 => "502 Bad Gateway",
                    503 => "503 Service Unavailable",
                    504 => "504 Gateway Timeout",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_text,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Backend that answers every request with the headers it received as JSON.
pub async fn start_header_echo_backend() -> SocketAddr {
    let (listener, addr) = bind_ephemeral().await;
    let app = Router::new().fallback(any(|headers: HeaderMap| async move {
        let map: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.into())))
            .collect();
        axum::Json(serde_json::Value::Object(map))
    }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// WebSocket backend that echoes text and binary frames.
///
/// Each accepted connection is reported on the returned channel.
pub async fn start_ws_echo_backend() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let (listener, addr) = bind_ephemeral().await;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                let _ = tx.send(());
                let (mut sink, mut stream) = ws.split();
                while let Some(Ok(message)) = stream.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, rx)
}

pub fn route(path: &str, service: &str) -> RouteConfig {
    RouteConfig {
        path: path.into(),
        match_kind: Default::default(),
        service: service.into(),
        rewrite: None,
        priority: Default::default(),
        websocket: false,
        connection_kind: Default::default(),
    }
}

pub fn service(name: &str, addrs: &[SocketAddr]) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        instances: addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| InstanceConfig {
                id: format!("{}-{}", name, i + 1),
                address: addr.to_string(),
                weight: 1,
                health_check_path: "/health".into(),
            })
            .collect(),
    }
}

/// Config with background probes off and short retry delays.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.health_check.enabled = false;
    config.observability.metrics_enabled = false;
    config.retries.base_delay_ms = 10;
    config.retries.max_delay_ms = 50;
    config.retries.jitter = false;
    config
}

pub struct Gateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub config_updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a gateway on an ephemeral port.
pub async fn start_gateway(mut config: GatewayConfig) -> Gateway {
    let (listener, addr) = bind_ephemeral().await;
    config.listener.bind_address = addr.to_string();

    let shutdown = Shutdown::new();
    let (config_tx, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config).unwrap();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    Gateway {
        addr,
        shutdown,
        config_updates: config_tx,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
