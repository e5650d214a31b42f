//! HTTP routes and worker assembly.

use crate::auth::JwtVerifier;
use crate::config::{BusBackend, Config, PresenceBackend};
use crate::metrics;
use crate::session;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::handshake::{token_from_authorization, token_from_cookie};
use courier_core::{
    AuthVerifier, Collaborators, EventBus, HandshakeConfig, HandshakeRequest, HubConfig, LocalBus,
    MemoryPresence, MemoryStore, Node, NodeConfig, PresenceDirectory, RedisBus, RedisPresence,
    RejectAllTokens,
};
use courier_protocol::{ClientEvent, ConnectionId, RawUserId, Version};
use courier_transport::{
    websocket_connection, PollingConfig, PollingSessions, TransportError, WebSocketConfig,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared worker state.
pub struct AppState {
    pub node: Arc<Node>,
    pub config: Config,
    pub worker: usize,
    pub polling: Arc<PollingSessions>,
    websocket: WebSocketConfig,
}

impl AppState {
    /// Build a worker from configuration, connecting to the configured
    /// backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed file cannot be loaded or a Redis backend
    /// cannot be reached.
    pub async fn build(config: Config, worker: usize) -> Result<Arc<Self>> {
        let collaborators = collaborators(&config).await?;
        Ok(Self::assemble(config, worker, collaborators))
    }

    /// Build a worker around existing collaborators.
    #[must_use]
    pub fn assemble(config: Config, worker: usize, collaborators: Collaborators) -> Arc<Self> {
        let node_config = NodeConfig {
            node_id: format!("worker-{worker}"),
            store_timeout: config.store_timeout(),
            hub: HubConfig {
                max_groups: config.limits.max_groups,
                max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            },
            handshake: HandshakeConfig {
                require_token: config.auth.require_token,
            },
        };
        let polling = PollingSessions::new(PollingConfig {
            poll_wait: Duration::from_millis(config.transport.poll_wait_ms),
            ..PollingConfig::default()
        });
        let websocket = WebSocketConfig {
            max_message_size: config.limits.max_message_size,
        };

        Arc::new(Self {
            node: Node::new(node_config, collaborators),
            config,
            worker,
            polling: Arc::new(polling),
            websocket,
        })
    }
}

/// Select the collaborators named by the configuration.
async fn collaborators(config: &Config) -> Result<Collaborators> {
    let store = Arc::new(match &config.store.seed_path {
        Some(path) => MemoryStore::load(path)
            .with_context(|| format!("Failed to load seed data: {}", path.display()))?,
        None => {
            warn!("No seed file configured, starting with an empty store");
            MemoryStore::new()
        }
    });

    let ttl = Duration::from_millis(config.presence.ttl_ms);
    let presence: Arc<dyn PresenceDirectory> = match config.presence.backend {
        PresenceBackend::Memory => Arc::new(MemoryPresence::with_ttl(ttl)),
        PresenceBackend::Redis => Arc::new(
            RedisPresence::connect(&config.redis.url, config.presence.key_prefix.clone(), ttl)
                .await
                .context("Failed to connect presence directory")?,
        ),
    };

    let bus: Arc<dyn EventBus> = match config.bus.backend {
        BusBackend::Local => Arc::new(LocalBus::with_capacity(config.bus.capacity)),
        BusBackend::Redis => RedisBus::spawn(
            &config.redis.url,
            config.bus.channel_prefix.clone(),
            config.bus.capacity,
        )
        .context("Failed to start event bus")?,
    };

    let auth: Arc<dyn AuthVerifier> = match &config.auth.secret {
        Some(secret) => Arc::new(JwtVerifier::new(secret.as_bytes())),
        None => {
            warn!("No auth secret configured, session tokens will be rejected");
            Arc::new(RejectAllTokens)
        }
    };

    Ok(Collaborators {
        directory: store.clone(),
        store,
        auth,
        presence,
        bus,
    })
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/internal/membership/:user", post(membership_handler));

    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }
    if transport.polling {
        let base = transport.polling_path.trim_end_matches('/').to_string();
        app = app.route(&base, post(polling_open_handler)).route(
            &format!("{base}/:sid"),
            get(polling_poll_handler)
                .post(polling_push_handler)
                .delete(polling_close_handler),
        );
    }

    app.with_state(state)
}

/// Serve a worker on an already-bound listener until it fails.
///
/// # Errors
///
/// Returns an error if the HTTP server stops with an error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    state.node.start();
    spawn_maintenance(&state);

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Run one worker on `port`.
///
/// # Errors
///
/// Returns an error if the worker cannot be assembled or bound.
pub async fn run_worker(config: Config, index: usize, port: u16) -> Result<()> {
    if config.metrics.enabled {
        metrics::init_metrics();
        let offset = u16::try_from(index).unwrap_or(u16::MAX);
        let metrics_port = config.metrics.port.saturating_add(offset);
        if let Err(e) = metrics::start_metrics_server(metrics_port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr(port)?;
    let state = AppState::build(config, index).await?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(worker = index, port, "Courier worker listening on {}", addr);
    if state.config.transport.websocket {
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, state.config.transport.websocket_path
        );
    }

    serve(listener, state).await
}

/// Presence lease renewal and polling session reaping.
fn spawn_maintenance(state: &Arc<AppState>) {
    let refresh = Duration::from_millis(state.config.presence.refresh_ms.max(1));
    let node = state.node.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = node.refresh_presence().await {
                warn!(node = node.node_id(), error = %e, "Presence refresh failed");
            }
            if let Err(e) = node.prune_presence().await {
                warn!(node = node.node_id(), error = %e, "Presence pruning failed");
            }
            metrics::set_hub_stats(&node.hub().stats());
        }
    });

    if state.config.transport.polling {
        let polling = state.polling.clone();
        let timeout = state.config.idle_timeout();
        let period = (timeout / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                polling.reap_idle(timeout);
            }
        });
    }
}

/// Connection parameters shared by WebSocket and polling.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
}

/// Collect handshake inputs from the query string and headers.
fn handshake_request(
    params: &ConnectParams,
    headers: &HeaderMap,
) -> Result<HandshakeRequest, Response> {
    let version = match params.protocol.as_deref().filter(|p| !p.is_empty()) {
        Some(raw) => match raw.parse::<Version>() {
            Ok(version) => Some(version),
            Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
        },
        None => None,
    };

    let header_str = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    let token = header_str(header::COOKIE)
        .and_then(token_from_cookie)
        .or_else(|| header_str(header::AUTHORIZATION).and_then(token_from_authorization));

    let hint = params.user_id.clone().map(RawUserId::from);
    Ok(HandshakeRequest::new(hint, token).with_version(version))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.node.hub().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "worker": state.worker,
        "connections": stats.connection_count,
        "groups": stats.group_count,
    }))
}

/// Ask every worker to resync a user's channel memberships.
///
/// The path segment may be any admissible encoding of the user id; unknown
/// users get `404`.
async fn membership_handler(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> StatusCode {
    let identity = match state.node.resolver().resolve(&RawUserId::from(user.as_str())).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!(user = %user, error = %e, "Membership resync for unknown user");
            return StatusCode::NOT_FOUND;
        }
    };

    match state
        .node
        .broadcaster()
        .request_resync(&identity.user_id)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!(user = %user, error = %e, "Membership resync request failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let request = match handshake_request(&params, &headers) {
        Ok(request) => request,
        Err(response) => return response,
    };

    ws.max_message_size(state.websocket.max_message_size)
        .on_upgrade(move |socket| async move {
            let id = ConnectionId::generate();
            debug!(connection = %id, remote = %addr, "WebSocket connected");
            let conn = websocket_connection(socket, id, Some(addr.to_string()), &state.websocket);
            session::run(state, conn, request).await;
        })
}

/// Open a polling session.
async fn polling_open_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let request = match handshake_request(&params, &headers) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let id = ConnectionId::generate();
    let conn = state.polling.open(id.clone(), Some(addr.to_string()));
    tokio::spawn(session::run(state, conn, request));

    Json(serde_json::json!({ "sid": id })).into_response()
}

fn polling_error(e: &TransportError) -> StatusCode {
    match e {
        TransportError::UnknownSession(_) => StatusCode::NOT_FOUND,
        TransportError::ConnectionClosed => StatusCode::GONE,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn polling_poll_handler(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    match state.polling.poll(&ConnectionId::from(sid)).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => polling_error(&e).into_response(),
    }
}

async fn polling_push_handler(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(event): Json<ClientEvent>,
) -> StatusCode {
    match state.polling.push(&ConnectionId::from(sid), event).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => polling_error(&e),
    }
}

async fn polling_close_handler(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> StatusCode {
    if state.polling.close(&ConnectionId::from(sid)) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
