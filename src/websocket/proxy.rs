//! Client ↔ backend WebSocket relay.
//!
//! # Responsibilities
//! - Bind an admitted connection to a backend through the service router
//! - Relay frames in both directions, answering control messages locally
//! - Propagate closes from either side to the other
//! - Re-bind once when the backend link fails, else close with 1011
//!
//! # Data Flow
//! ```text
//! client_rx ──► control::parse ──► (local reply) ──► client
//!                    │
//!                    └──► backend.tx
//! backend.rx ──────────────────────────────────────► client
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
};

use crate::context::RequestContext;
use crate::error::{AttemptError, GatewayError};
use crate::load_balancer::{InstanceGuard, ServiceInstance};
use crate::routing::ServiceRouter;
use crate::websocket::control::{self, ControlMessage, ControlReply};
use crate::websocket::manager::{BackendBinding, Connection, ConnectionManager};
use crate::websocket::{CloseReason, Frame, CLOSE_BACKEND_UNAVAILABLE};

/// Client frames held while the backend is still being bound.
const BIND_BACKLOG: usize = 64;

/// What to open on the backend side.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// Path and query sent upstream.
    pub path: String,
    /// Extra headers (correlation id, caller identity, priority).
    pub headers: Vec<(String, String)>,
}

/// Channels to a live backend connection.
///
/// `rx` yielding `None` without a preceding close frame means the link failed.
#[derive(Debug)]
pub struct BackendLink {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// Opens backend WebSocket connections.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        instance: &ServiceInstance,
        request: &BackendRequest,
    ) -> Result<BackendLink, AttemptError>;
}

/// Connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
    buffer_size: usize,
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            connect_timeout,
            buffer_size: buffer_size.max(1),
        }
    }
}

fn to_tungstenite(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(data) => tungstenite::Message::Binary(data.into()),
        Frame::Close(reason) => tungstenite::Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

#[async_trait]
impl BackendConnector for TungsteniteConnector {
    async fn connect(
        &self,
        instance: &ServiceInstance,
        request: &BackendRequest,
    ) -> Result<BackendLink, AttemptError> {
        let url = format!("ws://{}{}", instance.address, request.path);
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AttemptError::Connect(e.to_string()))?;
        for (name, value) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                ws_request.headers_mut().insert(name, value);
            }
        }

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(ws_request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(AttemptError::Connect(e.to_string())),
            Err(_) => return Err(AttemptError::Timeout),
        };

        let (mut sink, mut source) = stream.split();
        let (to_backend, mut outbound) = mpsc::channel::<Frame>(self.buffer_size);
        let (inbound, from_backend) = mpsc::channel::<Frame>(self.buffer_size);
        let instance_id = instance.id.clone();

        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let closing = matches!(frame, Frame::Close(_));
                if sink.send(to_tungstenite(frame)).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(tungstenite::Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                    Ok(tungstenite::Message::Binary(data)) => Frame::Binary(data.to_vec()),
                    Ok(tungstenite::Message::Close(close)) => {
                        let reason = close.map(|f| CloseReason::new(u16::from(f.code), f.reason.as_str()));
                        let _ = inbound.send(Frame::Close(reason)).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(instance = %instance_id, error = %e, "Backend WebSocket read failed");
                        break;
                    }
                };
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(BackendLink {
            tx: to_backend,
            rx: from_backend,
        })
    }
}

/// Live backend side of a relay.
struct Bound {
    link: BackendLink,
    guard: InstanceGuard,
}

impl Bound {
    fn instance(&self) -> &Arc<ServiceInstance> {
        self.guard.instance()
    }
}

/// Why the relay loop stopped.
enum Exit {
    ClientClosed(Option<CloseReason>),
    BackendClosed(Option<CloseReason>),
    Requested(Option<CloseReason>),
    BackendUnavailable,
}

/// Binds client connections to backends and relays frames.
pub struct WebSocketProxy {
    router: Arc<ServiceRouter>,
    manager: Arc<ConnectionManager>,
    connector: Arc<dyn BackendConnector>,
}

impl WebSocketProxy {
    pub fn new(
        router: Arc<ServiceRouter>,
        manager: Arc<ConnectionManager>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            router,
            manager,
            connector,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    async fn bind(
        &self,
        ctx: &mut RequestContext,
        connection: &Connection,
        request: &BackendRequest,
    ) -> Result<Bound, GatewayError> {
        let connector = self.connector.clone();
        let routed = self
            .router
            .execute(ctx, &connection.service, |instance, _budget| {
                let connector = connector.clone();
                let request = request.clone();
                async move { connector.connect(&instance, &request).await }
            })
            .await?;

        Ok(Bound {
            link: routed.value,
            guard: routed.guard,
        })
    }

    /// One routing decision, one connect attempt.
    async fn rebind(
        &self,
        ctx: &RequestContext,
        connection: &Connection,
        request: &BackendRequest,
        failed: &Arc<ServiceInstance>,
    ) -> Result<Bound, GatewayError> {
        self.router.record_failure(failed, connection.class);

        let target = self
            .router
            .route_excluding(
                &connection.service,
                connection.class,
                ctx.bypass_circuit(),
                std::slice::from_ref(&failed.id),
            )
            .await?;
        let instance = target.instance().clone();
        let started = Instant::now();

        match self.connector.connect(&instance, request).await {
            Ok(link) => Ok(Bound {
                link,
                guard: self.router.succeed(target, started.elapsed()),
            }),
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    instance = %instance.id,
                    error = %e,
                    "WebSocket re-bind connect failed"
                );
                self.router.fail(target);
                Err(GatewayError::BackendUnavailable(connection.service.clone()))
            }
        }
    }

    /// Bind while watching the client, so a disconnect or requested close
    /// cancels the pending backend connect.
    async fn bind_or_cancel(
        &self,
        ctx: &mut RequestContext,
        connection: &Connection,
        request: &BackendRequest,
        client_rx: &mut mpsc::Receiver<Frame>,
        backlog: &mut VecDeque<Frame>,
    ) -> Result<Result<Bound, GatewayError>, Exit> {
        let mut closed = connection.closed();
        if let Some(reason) = connection.close_requested() {
            return Err(Exit::Requested(Some(reason)));
        }

        let bind = self.bind(ctx, connection, request);
        tokio::pin!(bind);

        loop {
            tokio::select! {
                result = &mut bind => return Ok(result),
                _ = closed.changed() => return Err(Exit::Requested(connection.close_requested())),
                frame = client_rx.recv(), if backlog.len() < BIND_BACKLOG => match frame {
                    None => return Err(Exit::ClientClosed(None)),
                    Some(Frame::Close(reason)) => return Err(Exit::ClientClosed(reason)),
                    Some(frame) => {
                        connection.touch();
                        backlog.push_back(frame);
                    }
                },
            }
        }
    }

    /// Bind and relay until either side closes. Always deregisters on return.
    pub async fn run(
        &self,
        connection: Arc<Connection>,
        mut ctx: RequestContext,
        request: BackendRequest,
        mut client_rx: mpsc::Receiver<Frame>,
    ) {
        let client_tx = connection.outbound();
        let mut backlog = VecDeque::new();

        let bound = self
            .bind_or_cancel(&mut ctx, &connection, &request, &mut client_rx, &mut backlog)
            .await;
        let exit = match bound {
            Ok(Ok(bound)) => {
                self.relay(&connection, &ctx, &request, bound, backlog, &mut client_rx, &client_tx)
                    .await
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id(),
                    connection_id = %connection.id,
                    service = %connection.service,
                    error = %e,
                    "WebSocket backend bind failed"
                );
                Exit::BackendUnavailable
            }
            Err(exit) => {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id(),
                    connection_id = %connection.id,
                    "WebSocket closed before backend was bound"
                );
                exit
            }
        };

        connection.set_binding(None);
        match exit {
            Exit::ClientClosed(reason) => {
                tracing::debug!(connection_id = %connection.id, reason = ?reason, "Client closed");
            }
            Exit::BackendClosed(reason) | Exit::Requested(reason) => {
                let _ = client_tx.send(Frame::Close(reason)).await;
            }
            Exit::BackendUnavailable => {
                let _ = client_tx
                    .send(Frame::Close(Some(CloseReason::new(
                        CLOSE_BACKEND_UNAVAILABLE,
                        "backend unavailable",
                    ))))
                    .await;
            }
        }
        self.manager.deregister(connection.id);
    }

    async fn relay(
        &self,
        connection: &Connection,
        ctx: &RequestContext,
        request: &BackendRequest,
        mut bound: Bound,
        mut backlog: VecDeque<Frame>,
        client_rx: &mut mpsc::Receiver<Frame>,
        client_tx: &mpsc::Sender<Frame>,
    ) -> Exit {
        let mut closed = connection.closed();
        if let Some(reason) = connection.close_requested() {
            let _ = bound.link.tx.send(Frame::Close(None)).await;
            return Exit::Requested(Some(reason));
        }
        self.record_binding(connection, bound.instance());

        loop {
            // A frame the backend could not take, replayed after re-bind.
            let mut pending: Option<Frame> = None;

            tokio::select! {
                _ = closed.changed() => {
                    let reason = connection.close_requested();
                    let _ = bound.link.tx.send(Frame::Close(None)).await;
                    return Exit::Requested(reason);
                }
                frame = next_client_frame(&mut backlog, client_rx) => {
                    connection.touch();
                    match frame {
                        None => {
                            let _ = bound.link.tx.send(Frame::Close(None)).await;
                            return Exit::ClientClosed(None);
                        }
                        Some(Frame::Close(reason)) => {
                            let _ = bound.link.tx.send(Frame::Close(reason.clone())).await;
                            return Exit::ClientClosed(reason);
                        }
                        Some(Frame::Text(text)) => match control::parse(&text) {
                            Some(message) => {
                                let reply = self.handle_control(connection, message);
                                if client_tx.send(Frame::Text(reply.to_text())).await.is_err() {
                                    return Exit::ClientClosed(None);
                                }
                                continue;
                            }
                            None => {
                                if let Err(e) = bound.link.tx.send(Frame::Text(text)).await {
                                    pending = Some(e.0);
                                }
                            }
                        },
                        Some(frame) => {
                            if let Err(e) = bound.link.tx.send(frame).await {
                                pending = Some(e.0);
                            }
                        }
                    }
                    if pending.is_none() {
                        continue;
                    }
                }
                frame = bound.link.rx.recv() => match frame {
                    Some(Frame::Close(reason)) => return Exit::BackendClosed(reason),
                    Some(frame) => {
                        connection.touch();
                        if client_tx.send(frame).await.is_err() {
                            let _ = bound.link.tx.send(Frame::Close(None)).await;
                            return Exit::ClientClosed(None);
                        }
                        continue;
                    }
                    None => {}
                },
            }

            // Backend link failed.
            let failed = bound.instance().clone();
            tracing::warn!(
                correlation_id = %ctx.correlation_id(),
                connection_id = %connection.id,
                instance = %failed.id,
                "Backend WebSocket dropped, attempting re-bind"
            );
            connection.set_binding(None);

            bound = match self.rebind(ctx, connection, request, &failed).await {
                Ok(rebound) => rebound,
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        connection_id = %connection.id,
                        error = %e,
                        "WebSocket re-bind failed, closing client"
                    );
                    return Exit::BackendUnavailable;
                }
            };
            self.record_binding(connection, bound.instance());

            if let Some(frame) = pending {
                if bound.link.tx.send(frame).await.is_err() {
                    return Exit::BackendUnavailable;
                }
            }
        }
    }

    fn record_binding(&self, connection: &Connection, instance: &ServiceInstance) {
        tracing::info!(
            connection_id = %connection.id,
            service = %connection.service,
            instance = %instance.id,
            "WebSocket bound to backend"
        );
        connection.set_binding(Some(BackendBinding {
            instance_id: instance.id.clone(),
            address: instance.address.clone(),
        }));
    }

    fn handle_control(&self, connection: &Connection, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::Ping => ControlReply::Pong,
            ControlMessage::SessionBind { session_id } if session_id.trim().is_empty() => {
                ControlReply::Error {
                    message: "session_id must not be empty".into(),
                }
            }
            ControlMessage::SessionBind { session_id } => {
                self.manager.bind_session(connection.id, &session_id);
                tracing::debug!(connection_id = %connection.id, session = %session_id, "Session bound");
                ControlReply::SessionBound { session_id }
            }
        }
    }
}

/// Frames buffered during bind go first, in arrival order.
async fn next_client_frame(
    backlog: &mut VecDeque<Frame>,
    client_rx: &mut mpsc::Receiver<Frame>,
) -> Option<Frame> {
    match backlog.pop_front() {
        Some(frame) => Some(frame),
        None => client_rx.recv().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, ConnectionKind, RetryConfig, TimeoutConfig, WebSocketConfig};
    use crate::context::{AuthContext, Deadline, PriorityClass};
    use crate::discovery::{ServiceCache, ServiceDescriptor, StaticRegistry};
    use crate::health::PassiveHealth;
    use crate::load_balancer::{LoadBalancer, Strategy};
    use crate::resilience::{CircuitBreakerRegistry, RetryPolicies};
    use crate::websocket::manager::ConnectionRequest;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend side of an in-memory link.
    struct BackendEnd {
        instance_id: String,
        to_proxy: mpsc::Sender<Frame>,
        from_proxy: mpsc::Receiver<Frame>,
    }

    struct MemoryConnector {
        attempts: AtomicUsize,
        refusing: Mutex<HashSet<String>>,
        hanging: Arc<tokio::sync::Notify>,
        hang: std::sync::atomic::AtomicBool,
        ends: mpsc::UnboundedSender<BackendEnd>,
    }

    #[async_trait]
    impl BackendConnector for MemoryConnector {
        async fn connect(
            &self,
            instance: &ServiceInstance,
            _request: &BackendRequest,
        ) -> Result<BackendLink, AttemptError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                self.hanging.notify_one();
                std::future::pending::<()>().await;
            }
            if self.refusing.lock().unwrap().contains(&instance.id) {
                return Err(AttemptError::Connect("refused".into()));
            }
            let (to_backend, from_proxy) = mpsc::channel(16);
            let (to_proxy, from_backend) = mpsc::channel(16);
            let _ = self.ends.send(BackendEnd {
                instance_id: instance.id.clone(),
                to_proxy,
                from_proxy,
            });
            Ok(BackendLink {
                tx: to_backend,
                rx: from_backend,
            })
        }
    }

    struct Harness {
        proxy: Arc<WebSocketProxy>,
        connector: Arc<MemoryConnector>,
        ends: mpsc::UnboundedReceiver<BackendEnd>,
    }

    fn harness(ids: &[&str]) -> Harness {
        let registry = StaticRegistry::new();
        registry.set_instances(
            "chat",
            ids.iter()
                .map(|id| ServiceDescriptor {
                    id: id.to_string(),
                    address: format!("{}:80", id),
                    weight: 1,
                    health_check_path: "/health".into(),
                })
                .collect(),
        );
        let cache = Arc::new(ServiceCache::new(Arc::new(registry), Duration::from_secs(30)));
        let router = Arc::new(ServiceRouter::new(
            cache,
            LoadBalancer::new(Strategy::RoundRobin),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RetryPolicies::new(RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter: false,
                ..RetryConfig::default()
            }),
            TimeoutConfig::default(),
            PassiveHealth::default(),
        ));
        let (ends_tx, ends) = mpsc::unbounded_channel();
        let connector = Arc::new(MemoryConnector {
            attempts: AtomicUsize::new(0),
            refusing: Mutex::new(HashSet::new()),
            hanging: Arc::new(tokio::sync::Notify::new()),
            hang: std::sync::atomic::AtomicBool::new(false),
            ends: ends_tx,
        });
        let manager = Arc::new(ConnectionManager::new(WebSocketConfig::default()));
        Harness {
            proxy: Arc::new(WebSocketProxy::new(router, manager, connector.clone())),
            connector,
            ends,
        }
    }

    struct Client {
        connection: Arc<Connection>,
        to_proxy: mpsc::Sender<Frame>,
        from_proxy: mpsc::Receiver<Frame>,
        task: tokio::task::JoinHandle<()>,
    }

    fn connect_client(proxy: &Arc<WebSocketProxy>) -> Client {
        let (out_tx, from_proxy) = mpsc::channel(16);
        let connection = proxy
            .manager()
            .admit(
                ConnectionRequest {
                    user_id: "u1".into(),
                    session_id: None,
                    service: "chat".into(),
                    class: PriorityClass::Normal,
                    kind: ConnectionKind::Chat,
                },
                out_tx,
            )
            .unwrap();
        let (to_proxy, client_rx) = mpsc::channel(16);
        let ctx = RequestContext::new(
            None,
            AuthContext::default(),
            PriorityClass::Normal,
            false,
            Deadline::after(Duration::from_secs(5)),
        );
        let task = tokio::spawn({
            let proxy = proxy.clone();
            let connection = connection.clone();
            async move {
                proxy
                    .run(connection, ctx, BackendRequest::default(), client_rx)
                    .await
            }
        });
        Client {
            connection,
            to_proxy,
            from_proxy,
            task,
        }
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let mut h = harness(&["B1"]);
        let mut client = connect_client(&h.proxy);
        let mut backend = h.ends.recv().await.unwrap();

        client.to_proxy.send(Frame::Text("hello".into())).await.unwrap();
        assert_eq!(backend.from_proxy.recv().await, Some(Frame::Text("hello".into())));

        backend.to_proxy.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(client.from_proxy.recv().await, Some(Frame::Binary(vec![1, 2, 3])));

        assert_eq!(client.connection.binding().unwrap().instance_id, "B1");
    }

    #[tokio::test]
    async fn test_control_messages_answered_locally() {
        let mut h = harness(&["B1"]);
        let mut client = connect_client(&h.proxy);
        let mut backend = h.ends.recv().await.unwrap();

        client.to_proxy.send(Frame::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(client.from_proxy.recv().await, Some(Frame::Text(r#"{"type":"pong"}"#.into())));

        client
            .to_proxy
            .send(Frame::Text(r#"{"type":"session_bind","session_id":"s-9"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            client.from_proxy.recv().await,
            Some(Frame::Text(r#"{"type":"session_bound","session_id":"s-9"}"#.into()))
        );
        assert_eq!(h.proxy.manager().by_session("s-9").len(), 1);

        // Only ordinary traffic reaches the backend.
        client.to_proxy.send(Frame::Text("data".into())).await.unwrap();
        assert_eq!(backend.from_proxy.recv().await, Some(Frame::Text("data".into())));
    }

    #[tokio::test]
    async fn test_client_close_closes_backend_and_deregisters() {
        let mut h = harness(&["B1"]);
        let client = connect_client(&h.proxy);
        let mut backend = h.ends.recv().await.unwrap();

        client.to_proxy.send(Frame::Close(None)).await.unwrap();
        assert_eq!(backend.from_proxy.recv().await, Some(Frame::Close(None)));
        client.task.await.unwrap();
        assert!(h.proxy.manager().is_empty());
    }

    #[tokio::test]
    async fn test_backend_close_propagates_to_client() {
        let mut h = harness(&["B1"]);
        let mut client = connect_client(&h.proxy);
        let backend = h.ends.recv().await.unwrap();

        let reason = CloseReason::new(1000, "bye");
        backend.to_proxy.send(Frame::Close(Some(reason.clone()))).await.unwrap();
        assert_eq!(client.from_proxy.recv().await, Some(Frame::Close(Some(reason))));
        client.task.await.unwrap();
        assert!(h.proxy.manager().is_empty());
    }

    #[tokio::test]
    async fn test_backend_drop_rebinds_once_then_closes_unavailable() {
        let mut h = harness(&["B1"]);
        let mut client = connect_client(&h.proxy);
        let backend = h.ends.recv().await.unwrap();
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);

        h.connector.refusing.lock().unwrap().insert("B1".into());
        drop(backend);

        match client.from_proxy.recv().await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, CLOSE_BACKEND_UNAVAILABLE),
            other => panic!("expected close, got {:?}", other),
        }
        client.task.await.unwrap();

        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
        assert!(h.proxy.manager().is_empty());
        assert!(h.proxy.manager().by_user("u1").is_empty());
        assert!(h.proxy.manager().by_service("chat").is_empty());
    }

    #[tokio::test]
    async fn test_backend_drop_rebinds_to_other_instance() {
        let mut h = harness(&["B1", "B2"]);
        let mut client = connect_client(&h.proxy);
        let first = h.ends.recv().await.unwrap();
        let failed_id = first.instance_id.clone();
        drop(first);

        let mut second = h.ends.recv().await.unwrap();
        assert_ne!(second.instance_id, failed_id);

        client.to_proxy.send(Frame::Text("after".into())).await.unwrap();
        assert_eq!(second.from_proxy.recv().await, Some(Frame::Text("after".into())));
        second.to_proxy.send(Frame::Text("reply".into())).await.unwrap();
        assert_eq!(client.from_proxy.recv().await, Some(Frame::Text("reply".into())));
        assert_eq!(client.connection.binding().unwrap().instance_id, second.instance_id);
    }

    #[tokio::test]
    async fn test_initial_bind_failure_closes_unavailable() {
        let h = harness(&["B1"]);
        h.connector.refusing.lock().unwrap().insert("B1".into());
        let mut client = connect_client(&h.proxy);

        match client.from_proxy.recv().await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, CLOSE_BACKEND_UNAVAILABLE),
            other => panic!("expected close, got {:?}", other),
        }
        client.task.await.unwrap();
        // initial bind follows the normal retry ceiling
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 3);
        assert!(h.proxy.manager().is_empty());
    }

    #[tokio::test]
    async fn test_requested_close_reaches_both_sides() {
        let mut h = harness(&["B1"]);
        let mut client = connect_client(&h.proxy);
        let mut backend = h.ends.recv().await.unwrap();

        client.connection.close(CloseReason::new(1001, "idle timeout"));
        assert_eq!(backend.from_proxy.recv().await, Some(Frame::Close(None)));
        assert_eq!(
            client.from_proxy.recv().await,
            Some(Frame::Close(Some(CloseReason::new(1001, "idle timeout"))))
        );
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_drop_cancels_pending_bind() {
        let h = harness(&["B1"]);
        h.connector.hang.store(true, Ordering::SeqCst);
        let client = connect_client(&h.proxy);
        h.connector.hanging.notified().await;

        drop(client.to_proxy);
        tokio::time::timeout(Duration::from_secs(1), client.task)
            .await
            .expect("bind should be cancelled")
            .unwrap();
        assert!(h.proxy.manager().is_empty());
        assert_eq!(h.proxy.router.cache().cached("chat").unwrap()[0].active_connections(), 0);
    }

    #[tokio::test]
    async fn test_requested_close_cancels_pending_bind() {
        let h = harness(&["B1"]);
        h.connector.hang.store(true, Ordering::SeqCst);
        let mut client = connect_client(&h.proxy);
        h.connector.hanging.notified().await;

        client.connection.close(CloseReason::new(1001, "gateway shutting down"));
        assert_eq!(
            client.from_proxy.recv().await,
            Some(Frame::Close(Some(CloseReason::new(1001, "gateway shutting down"))))
        );
        tokio::time::timeout(Duration::from_secs(1), client.task)
            .await
            .expect("bind should be cancelled")
            .unwrap();
        assert!(h.proxy.manager().is_empty());
    }
}
