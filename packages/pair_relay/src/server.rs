//! HTTP surface: the relay WebSocket endpoint plus health and status routes.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::actor::RelayHandle;
use crate::config::RelayConfig;
use crate::handler::handle_relay_ws;
use crate::hub::RelayStatus;
use crate::metrics::{HealthStatus, MetricsSnapshot, ServerMetrics};

/// Shared state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHandle,
    pub metrics: Arc<ServerMetrics>,
}

/// Adds a unique request ID to each incoming request's span
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Legacy peers connect at the root, newer ones at /ws
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(health_live_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_relay_ws(socket, state.hub))
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> Response {
    match state.hub.status().await {
        Ok(status) => Json(HealthStatus {
            status: "healthy".to_string(),
            connections: status.connections as u64,
            sessions: status.sessions,
            uptime_secs: state.metrics.uptime_secs(),
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        )
            .into_response(),
    }
}

/// Liveness check: returns 200 if the process is serving HTTP
async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    timestamp: String,
    relay: RelayStatus,
    metrics: MetricsSnapshot,
}

/// Relay snapshot plus counters
async fn status_handler(State(state): State<AppState>) -> Response {
    match state.hub.status().await {
        Ok(relay) => Json(StatusResponse {
            timestamp: chrono::Utc::now().to_rfc3339(),
            relay,
            metrics: state.metrics.snapshot(),
        })
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// A running relay server.
pub struct RelayServer {
    addr: SocketAddr,
    hub: RelayHandle,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl RelayServer {
    /// Bind `config.host:config.port` and start serving.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
        Self::start(listener, config).await
    }

    /// Start serving on an already bound listener.
    pub async fn start(listener: TcpListener, config: &RelayConfig) -> Result<Self> {
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(ServerMetrics::new());
        let hub = RelayHandle::spawn(config, metrics.clone(), shutdown.clone());
        let app = router(AppState {
            hub: hub.clone(),
            metrics,
        });

        let graceful = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
                .context("Server error")
        });

        info!("Relay listening on ws://{}", addr);
        Ok(Self {
            addr,
            hub,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hub(&self) -> &RelayHandle {
        &self.hub
    }

    /// Stop accepting connections and close every open socket.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the server task to finish.
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("Server task panicked")?
    }
}
