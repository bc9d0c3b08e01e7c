//! WebSocket connection tracking.
//!
//! # Responsibilities
//! - Admit connections under the global and per-user quotas
//! - Index live connections by id, user, session and service
//! - Track last activity and evict idle connections per connection kind
//! - Broadcast frames to connections matching a filter
//!
//! # Design Decisions
//! - A single mutex guards every index, so the quota check and the insert
//!   are one atomic admission step
//! - Closing is signalled through a watch channel; the relay task owns the
//!   sockets and performs the actual close
//! - Deregistration is idempotent

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::{ConnectionKind, WebSocketConfig};
use crate::context::PriorityClass;
use crate::error::{GatewayError, LimitScope};
use crate::observability::metrics;
use crate::websocket::{CloseReason, Frame, CLOSE_GOING_AWAY};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// What a client asked for at handshake time.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub user_id: String,
    pub session_id: Option<String>,
    pub service: String,
    pub class: PriorityClass,
    pub kind: ConnectionKind,
}

/// Backend a connection is currently relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendBinding {
    pub instance_id: String,
    pub address: String,
}

/// A live client connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    pub service: String,
    pub class: PriorityClass,
    pub kind: ConnectionKind,
    pub created_at: Instant,
    session_id: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    binding: Mutex<Option<BackendBinding>>,
    outbound: mpsc::Sender<Frame>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    fn new(request: ConnectionRequest, outbound: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        let (close_tx, _) = watch::channel(None);
        Self {
            id: ConnectionId::new(),
            user_id: request.user_id,
            service: request.service,
            class: request.class,
            kind: request.kind,
            created_at: now,
            session_id: Mutex::new(request.session_id),
            last_activity: Mutex::new(now),
            binding: Mutex::new(None),
            outbound,
            close_tx,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("connection session mutex poisoned").clone()
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let mut last = self.last_activity.lock().expect("connection activity mutex poisoned");
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("connection activity mutex poisoned")
    }

    pub fn binding(&self) -> Option<BackendBinding> {
        self.binding.lock().expect("connection binding mutex poisoned").clone()
    }

    pub fn set_binding(&self, binding: Option<BackendBinding>) {
        *self.binding.lock().expect("connection binding mutex poisoned") = binding;
    }

    /// Sender for frames to the client, for callers that must wait for room.
    pub fn outbound(&self) -> mpsc::Sender<Frame> {
        self.outbound.clone()
    }

    /// Queue a frame for the client. Fails if the client is gone or too slow.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Ask the relay to close this connection.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_requested(&self) -> Option<CloseReason> {
        self.close_tx.borrow().clone()
    }

    /// Receiver that changes once a close is requested.
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }
}

/// Selects connections for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastFilter {
    All,
    User(String),
    Session(String),
    Service(String),
}

/// Counts for the monitoring surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub users: usize,
    pub sessions: usize,
    pub by_service: HashMap<String, usize>,
    pub by_kind: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Indexes {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_session: HashMap<String, HashSet<ConnectionId>>,
    by_service: HashMap<String, HashSet<ConnectionId>>,
}

impl Indexes {
    fn ids(&self, filter: &BroadcastFilter) -> Vec<ConnectionId> {
        let set = match filter {
            BroadcastFilter::All => return self.by_id.keys().copied().collect(),
            BroadcastFilter::User(user) => self.by_user.get(user),
            BroadcastFilter::Session(session) => self.by_session.get(session),
            BroadcastFilter::Service(service) => self.by_service.get(service),
        };
        set.map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    fn lookup(&self, filter: &BroadcastFilter) -> Vec<Arc<Connection>> {
        self.ids(filter)
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

fn index_insert(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    index.entry(key.to_string()).or_default().insert(id);
}

fn index_remove(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// Lifecycle owner for every client WebSocket connection.
#[derive(Debug)]
pub struct ConnectionManager {
    config: WebSocketConfig,
    indexes: Mutex<Indexes>,
}

impl ConnectionManager {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            indexes: Mutex::new(Indexes::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indexes> {
        self.indexes.lock().expect("connection manager mutex poisoned")
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Check quotas and register in one step.
    pub fn admit(
        &self,
        request: ConnectionRequest,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<Connection>, GatewayError> {
        let mut indexes = self.lock();

        if indexes.by_id.len() >= self.config.max_connections {
            drop(indexes);
            return Err(self.reject(&request, LimitScope::Global, self.config.max_connections));
        }
        let user_count = indexes.by_user.get(&request.user_id).map_or(0, HashSet::len);
        if user_count >= self.config.max_connections_per_user {
            drop(indexes);
            return Err(self.reject(&request, LimitScope::User, self.config.max_connections_per_user));
        }

        let connection = Arc::new(Connection::new(request, outbound));
        let id = connection.id;
        indexes.by_id.insert(id, connection.clone());
        index_insert(&mut indexes.by_user, &connection.user_id, id);
        index_insert(&mut indexes.by_service, &connection.service, id);
        if let Some(session) = connection.session_id() {
            index_insert(&mut indexes.by_session, &session, id);
        }
        let total = indexes.by_id.len();
        drop(indexes);

        tracing::info!(
            connection_id = %id,
            user = %connection.user_id,
            service = %connection.service,
            class = %connection.class,
            kind = ?connection.kind,
            total = total,
            "WebSocket connection admitted"
        );
        metrics::record_ws_admitted(&connection.service);
        metrics::record_ws_active(total);
        Ok(connection)
    }

    fn reject(&self, request: &ConnectionRequest, scope: LimitScope, limit: usize) -> GatewayError {
        tracing::warn!(
            user = %request.user_id,
            service = %request.service,
            scope = %scope,
            limit = limit,
            "WebSocket connection rejected"
        );
        metrics::record_ws_rejected(scope);
        GatewayError::ConnectionLimitExceeded { scope, limit }
    }

    /// Remove a connection from every index.
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut indexes = self.lock();
        let connection = indexes.by_id.remove(&id)?;
        index_remove(&mut indexes.by_user, &connection.user_id, id);
        index_remove(&mut indexes.by_service, &connection.service, id);
        if let Some(session) = connection.session_id() {
            index_remove(&mut indexes.by_session, &session, id);
        }
        let total = indexes.by_id.len();
        drop(indexes);

        tracing::info!(
            connection_id = %id,
            user = %connection.user_id,
            lifetime = ?connection.created_at.elapsed(),
            "WebSocket connection deregistered"
        );
        metrics::record_ws_active(total);
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(connection) = self.get(id) {
            connection.touch();
        }
    }

    /// Move a connection to a new session.
    pub fn bind_session(&self, id: ConnectionId, session_id: &str) -> bool {
        let mut indexes = self.lock();
        let Some(connection) = indexes.by_id.get(&id).cloned() else {
            return false;
        };
        let previous = {
            let mut session = connection.session_id.lock().expect("connection session mutex poisoned");
            session.replace(session_id.to_string())
        };
        if let Some(previous) = previous {
            index_remove(&mut indexes.by_session, &previous, id);
        }
        index_insert(&mut indexes.by_session, session_id, id);
        true
    }

    pub fn by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.lock().lookup(&BroadcastFilter::User(user_id.to_string()))
    }

    pub fn by_session(&self, session_id: &str) -> Vec<Arc<Connection>> {
        self.lock().lookup(&BroadcastFilter::Session(session_id.to_string()))
    }

    pub fn by_service(&self, service: &str) -> Vec<Arc<Connection>> {
        self.lock().lookup(&BroadcastFilter::Service(service.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `frame` on every matching connection; returns how many accepted it.
    pub fn broadcast(&self, filter: &BroadcastFilter, frame: Frame) -> usize {
        let targets = self.lock().lookup(filter);
        targets
            .iter()
            .filter(|c| {
                let sent = c.send(frame.clone());
                if sent {
                    c.touch();
                }
                sent
            })
            .count()
    }

    /// Close and deregister connections idle past their kind's timeout.
    pub fn sweep_idle(&self, now: Instant) -> Vec<ConnectionId> {
        let idle: Vec<Arc<Connection>> = self
            .lock()
            .by_id
            .values()
            .filter(|c| now.saturating_duration_since(c.last_activity()) > self.config.idle_timeout(c.kind))
            .cloned()
            .collect();

        for connection in &idle {
            tracing::info!(
                connection_id = %connection.id,
                user = %connection.user_id,
                kind = ?connection.kind,
                idle = ?now.saturating_duration_since(connection.last_activity()),
                "Evicting idle WebSocket connection"
            );
            connection.close(CloseReason::new(CLOSE_GOING_AWAY, "idle timeout"));
            self.deregister(connection.id);
        }
        idle.iter().map(|c| c.id).collect()
    }

    /// Ask every connection to close, e.g. on shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        let all = self.lock().lookup(&BroadcastFilter::All);
        for connection in all {
            connection.close(reason.clone());
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tracing::info!(interval = ?interval, "WebSocket idle sweeper starting");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_idle(Instant::now());
                    if !evicted.is_empty() {
                        tracing::debug!(count = evicted.len(), "Idle sweep complete");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("WebSocket sweeper received shutdown signal, exiting loop");
                    self.close_all(CloseReason::new(CLOSE_GOING_AWAY, "gateway shutting down"));
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let indexes = self.lock();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for connection in indexes.by_id.values() {
            let kind = match connection.kind {
                ConnectionKind::Chat => "chat",
                ConnectionKind::Session => "session",
                ConnectionKind::Monitoring => "monitoring",
            };
            *by_kind.entry(kind.to_string()).or_default() += 1;
        }
        ConnectionStats {
            total: indexes.by_id.len(),
            max_connections: self.config.max_connections,
            max_connections_per_user: self.config.max_connections_per_user,
            users: indexes.by_user.len(),
            sessions: indexes.by_session.len(),
            by_service: indexes
                .by_service
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            by_kind,
        }
    }
}
