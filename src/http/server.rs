//! HTTP server setup and request forwarding.
//!
//! # Responsibilities
//! - Create the Axum router and wire up middleware (tracing, body limit, correlation ID)
//! - Resolve route rules and hand HTTP requests to the service router
//! - Hand WebSocket upgrades to the WebSocket proxy
//! - Start background tasks (registry refresh, health checks, idle sweep, admin)
//! - Swap the route table when the config file changes
//!
//! # Data Flow
//! ```text
//! request
//!     → correlation ID layer
//!     → RouteTable::match_path (miss → 404 envelope)
//!     → build_context (priority, bypass, auth, deadline)
//!     → upgrade?  http/websocket.rs
//!     → ServiceRouter::execute (retry, failover, breaker, timeouts)
//!     → response hooks → client
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::admin;
use crate::config::validation::validate_config;
use crate::config::{GatewayConfig, RegistryKind};
use crate::context::RequestContext;
use crate::discovery::{HttpRegistry, ServiceRegistry, StaticRegistry};
use crate::error::{AttemptError, GatewayError};
use crate::health::HealthMonitor;
use crate::http::request::{
    build_context, context_headers, correlation_id, propagate_correlation_id_layer,
    set_correlation_id_layer, upstream_path_and_query, upstream_request,
};
use crate::http::response::{from_upstream, set_correlation_id, ErrorResponse, ResponseHook};
use crate::http::websocket;
use crate::observability::metrics;
use crate::routing::{RouteTable, ServiceRouter};
use crate::websocket::{
    BackendConnector, CloseReason, ConnectionManager, TungsteniteConnector, WebSocketProxy,
    CLOSE_GOING_AWAY,
};

/// Errors raised while assembling the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid route pattern: {0}")]
    Route(#[from] regex::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub router: Arc<ServiceRouter>,
    pub ws_proxy: Arc<WebSocketProxy>,
    pub client: Client<HttpConnector, Body>,
    pub hooks: Arc<Vec<Arc<dyn ResponseHook>>>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.ws_proxy.manager()
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    config: GatewayConfig,
    state: AppState,
    static_registry: Option<Arc<StaticRegistry>>,
}

impl HttpServer {
    /// Create a server whose registry is chosen by `config.registry.kind`.
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        match config.registry.kind {
            RegistryKind::Static => {
                let registry = Arc::new(StaticRegistry::from_config(&config.services));
                let mut server = Self::with_registry(config, registry.clone())?;
                server.static_registry = Some(registry);
                Ok(server)
            }
            RegistryKind::Http => {
                let url = config.registry.url.clone().ok_or_else(|| {
                    GatewayError::Registry("registry.url is required for the http registry".into())
                })?;
                let registry = HttpRegistry::new(&url, Duration::from_secs(config.registry.timeout_secs))?;
                Self::with_registry(config, Arc::new(registry))
            }
        }
    }

    /// Create a server over an externally supplied registry.
    pub fn with_registry(
        config: GatewayConfig,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self, ServerError> {
        let routes = Arc::new(ArcSwap::from_pointee(RouteTable::from_config(&config.routes)?));
        let router = Arc::new(ServiceRouter::from_config(&config, registry));
        let manager = Arc::new(ConnectionManager::new(config.websocket.clone()));
        let connector = Arc::new(TungsteniteConnector::new(
            Duration::from_millis(config.websocket.connect_timeout_ms),
            config.websocket.buffer_size,
        ));
        let ws_proxy = Arc::new(WebSocketProxy::new(router.clone(), manager, connector));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(HttpConnector::new());

        let state = AppState {
            routes,
            router,
            ws_proxy,
            client,
            hooks: Arc::new(Vec::new()),
            max_body_bytes: config.listener.max_body_bytes,
        };

        Ok(Self {
            config,
            state,
            static_registry: None,
        })
    }

    /// Replace the backend WebSocket connector.
    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        let manager = self.state.connections().clone();
        self.state.ws_proxy = Arc::new(WebSocketProxy::new(
            self.state.router.clone(),
            manager,
            connector,
        ));
        self
    }

    /// Register a hook run on every successful backend response.
    pub fn with_response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        Arc::make_mut(&mut self.state.hooks).push(hook);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Build the Axum router with all middleware layers.
    pub fn app(&self) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(self.state.clone())
            .layer(RequestBodyLimitLayer::new(self.config.listener.max_body_bytes))
            .layer(propagate_correlation_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_correlation_id_layer())
    }

    /// Run the server until `shutdown` fires.
    ///
    /// Config updates received on `config_updates` swap the route table and,
    /// with the static registry, the instance lists.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.state.routes.load().len(),
            "HTTP server starting"
        );

        let cache = self.state.router.cache().clone();
        tokio::spawn(cache.clone().run_refresher(
            Duration::from_secs(self.config.registry.refresh_interval_secs.max(1)),
            shutdown.resubscribe(),
        ));

        if self.config.health_check.enabled {
            let monitor = HealthMonitor::new(cache, self.config.health_check.clone());
            tokio::spawn(monitor.run(shutdown.resubscribe()));
        }

        let manager = self.state.connections().clone();
        tokio::spawn(manager.clone().run_sweeper(shutdown.resubscribe()));

        if self.config.admin.enabled {
            let admin_listener = TcpListener::bind(&self.config.admin.bind_address).await?;
            let admin_app = admin::setup_admin_router(&self.state, &self.config.admin);
            let mut admin_shutdown = shutdown.resubscribe();
            tracing::info!(address = %self.config.admin.bind_address, "Admin server starting");
            tokio::spawn(async move {
                let served = axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "Admin server failed");
                }
            });
        }

        tokio::spawn(apply_config_updates(
            self.state.routes.clone(),
            self.static_registry.clone(),
            config_updates,
            shutdown.resubscribe(),
        ));

        let app = self.app().into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
                manager.close_all(CloseReason::new(CLOSE_GOING_AWAY, "gateway shutting down"));
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Apply hot-reloaded configs until shutdown.
///
/// Only route rules and static instance lists change at runtime; everything
/// else needs a restart.
async fn apply_config_updates(
    routes: Arc<ArcSwap<RouteTable>>,
    static_registry: Option<Arc<StaticRegistry>>,
    mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(config) = update else { break };
                if let Err(errors) = validate_config(&config) {
                    for e in &errors {
                        tracing::error!(error = %e, "Rejected config update");
                    }
                    continue;
                }
                match RouteTable::from_config(&config.routes) {
                    Ok(table) => {
                        tracing::info!(routes = table.len(), "Route table reloaded");
                        routes.store(Arc::new(table));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected route update");
                        continue;
                    }
                }
                if let Some(registry) = &static_registry {
                    for service in &config.services {
                        registry.set_instances(&service.name, service.instances.clone());
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Main proxy handler: resolve the route, then forward with failover.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let correlation = correlation_id(request.headers())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let Some(matched) = state.routes.load().match_path(&path) else {
        tracing::warn!(correlation_id = %correlation, path = %path, "No route matched");
        metrics::record_request(&method, 404, "none", start);
        return ErrorResponse::new(GatewayError::RouteNotFound(path), correlation).into_response();
    };
    let route = matched.route;

    let ctx = match build_context(request.headers(), route.priority, peer, |class| {
        state.router.timeouts(class)
    }) {
        Ok(ctx) => ctx,
        Err(e) => {
            metrics::record_request(&method, e.status_code().as_u16(), &route.service, start);
            return ErrorResponse::new(e, correlation).into_response();
        }
    };

    tracing::debug!(
        correlation_id = %ctx.correlation_id(),
        method = %method,
        path = %path,
        service = %route.service,
        class = %ctx.priority(),
        "Routing request"
    );

    if is_upgrade_request(request.headers()) {
        if !route.websocket {
            let e = GatewayError::BadRequest(format!("route '{}' does not accept WebSocket upgrades", route.path));
            return ErrorResponse::new(e, correlation).into_response();
        }
        let (mut parts, _) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => websocket::handle_upgrade(state, upgrade, parts, route, matched.upstream_path, ctx, peer),
            Err(rejection) => rejection.into_response(),
        };
    }

    let response = forward(&state, request, &route.service, &matched.upstream_path, ctx, peer).await;
    let mut response = match response {
        Ok((mut response, ctx)) => {
            for hook in state.hooks.iter() {
                hook.on_response(&route, &ctx, &mut response);
            }
            response
        }
        Err(e) => {
            tracing::warn!(
                correlation_id = %correlation,
                service = %route.service,
                error = %e,
                "Request failed"
            );
            ErrorResponse::new(e, correlation.clone()).into_response()
        }
    };

    metrics::record_request(&method, response.status().as_u16(), &route.service, start);
    set_correlation_id(&mut response, &correlation);
    response
}

/// Buffer the body and run the request through the service router.
async fn forward(
    state: &AppState,
    request: Request<Body>,
    service: &str,
    upstream_path: &str,
    mut ctx: RequestContext,
    peer: Option<SocketAddr>,
) -> Result<(Response, RequestContext), GatewayError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("request body rejected: {}", e)))?;

    let path_and_query = upstream_path_and_query(upstream_path, &parts.uri);
    let ctx_headers = context_headers(&ctx, peer);
    let client = state.client.clone();

    let routed = state
        .router
        .execute(&mut ctx, service, |instance, _budget| {
            let upstream = upstream_request(&parts, &instance.address, &path_and_query, body.clone(), &ctx_headers);
            let client = client.clone();
            async move {
                let upstream = upstream.map_err(|e| AttemptError::Connect(e.to_string()))?;
                let response = client
                    .request(upstream)
                    .await
                    .map_err(|e| AttemptError::Connect(e.to_string()))?;
                match response.status() {
                    StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT => Err(AttemptError::Upstream(response.status().as_u16())),
                    _ => Ok(response),
                }
            }
        })
        .await?;

    tracing::debug!(
        correlation_id = %ctx.correlation_id(),
        instance = %routed.instance().id,
        attempts = routed.attempts,
        "Upstream responded"
    );

    Ok((from_upstream(routed.value, routed.guard), ctx))
}
