//! Axum gateway: auth handshake routes, health snapshot, and the
//! stream/ctrl WebSocket endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use glimpse_core::events::StreamEvent;
use glimpse_stream::{ControlState, SessionSource, StreamingStats};
use glimpse_telemetry::AuditSink;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::client::{self, ClientId, ClientRegistry, Namespace};
use crate::config::GateConfig;
use crate::ctrl::CtrlChannel;
use crate::security::{authorize_connection, ConnectAuth, FixedWindowRateLimiter, NonceStore};

/// Server bind settings.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5009,
            max_send_queue: 256,
        }
    }
}

/// Shared state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<GateConfig>,
    pub nonces: Arc<NonceStore>,
    pub connect_limiter: Arc<FixedWindowRateLimiter>,
    pub audit: Arc<AuditSink>,
    pub registry: Arc<ClientRegistry>,
    pub ctrl: Arc<CtrlChannel>,
    pub stats: Arc<StreamingStats>,
    pub ctrl_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/nonce", get(nonce_handler))
        .route("/auth/config", get(auth_config_handler))
        .route("/healthz", get(healthz_handler))
        .route("/ws/stream", get(stream_ws_handler))
        .route("/ws/ctrl", get(ctrl_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the gateway. The returned handle keeps its background tasks
/// alive for the life of the server.
pub async fn start(
    config: ServerConfig,
    gate: GateConfig,
    control: Arc<ControlState>,
    stats: Arc<StreamingStats>,
    source: Arc<dyn SessionSource>,
    events: broadcast::Sender<StreamEvent>,
    audit: Arc<AuditSink>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let gate = Arc::new(gate);
    let nonces = Arc::new(NonceStore::for_config(&gate));
    let connect_limiter = Arc::new(FixedWindowRateLimiter::per_minute(gate.connects_per_minute));
    let ctrl = Arc::new(CtrlChannel::new(
        control,
        Arc::clone(&registry),
        Arc::clone(&audit),
        FixedWindowRateLimiter::per_minute(gate.events_per_minute),
        source,
    ));

    let bridge = start_frame_bridge(Arc::clone(&registry), events.subscribe());
    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        std::time::Duration::from_secs(60),
    );

    let (ctrl_tx, ctrl_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let ctrl_task = tokio::spawn(process_ctrl_messages(ctrl_rx, Arc::clone(&ctrl)));

    let state = AppState {
        gate,
        nonces,
        connect_limiter,
        audit,
        registry,
        ctrl,
        stats,
        ctrl_tx,
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "streaming gateway started");

    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _bridge: bridge,
        _ctrl: ctrl_task,
        _cleanup: cleanup,
    })
}

/// Keeps the gateway's background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _ctrl: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// Forward pipeline events to every stream viewer.
fn start_frame_bridge(
    registry: Arc<ClientRegistry>,
    mut rx: broadcast::Receiver<StreamEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        registry.broadcast(Namespace::Stream, &json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "frame bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn process_ctrl_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    ctrl: Arc<CtrlChannel>,
) {
    while let Some((sid, raw)) = rx.recv().await {
        ctrl.handle_message(&sid, &raw).await;
    }
}

async fn nonce_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.nonces.issue())
}

async fn auth_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gate.to_public())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<ConnectAuth>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, Namespace::Stream, auth, &headers, addr)
}

async fn ctrl_ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<ConnectAuth>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, Namespace::Ctrl, auth, &headers, addr)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    namespace: Namespace,
    auth: ConnectAuth,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Response {
    // The sid is minted before authorization so denials can name it.
    let sid = ClientId::new();
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ip = addr.ip().to_string();

    let allowed = authorize_connection(
        &state.gate,
        &state.nonces,
        &state.connect_limiter,
        &state.audit,
        namespace.as_str(),
        &sid.0,
        origin.as_deref(),
        Some(&ip),
        &auth,
    );
    if !allowed {
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let rx = state.registry.attach(sid.clone(), namespace);
        tracing::info!(client_id = %sid, namespace = %namespace, "viewer connected");
        match namespace {
            Namespace::Stream => {
                client::handle_ws_connection(socket, sid, rx, Arc::clone(&state.registry), None)
                    .await;
            }
            Namespace::Ctrl => {
                state.ctrl.on_connect(&sid);
                client::handle_ws_connection(
                    socket,
                    sid.clone(),
                    rx,
                    Arc::clone(&state.registry),
                    Some(state.ctrl_tx.clone()),
                )
                .await;
                state.ctrl.on_disconnect(&sid);
            }
        }
        tracing::info!(namespace = %namespace, "viewer disconnected");
    })
    .into_response()
}
