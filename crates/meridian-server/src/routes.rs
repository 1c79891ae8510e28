//! HTTP and WebSocket routes for Meridian server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use meridian_core::{DependencyMonitor, EventBus, KernelManager, NotebookId, SessionRegistry};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::ServerConfig;
use crate::routers::{self, NotebookManager};
use crate::transport::split_socket;

/// Application state shared across handlers.
pub struct AppState {
    /// Process-wide event bus.
    pub bus: EventBus,
    /// Running kernels, shared by all connections.
    pub registry: Arc<SessionRegistry>,
    /// Turns kernel output into dependency status events.
    pub monitor: Arc<DependencyMonitor>,
    /// Notebook collaborator; notebook commands fail without one.
    pub notebooks: Option<Arc<dyn NotebookManager>>,
    pub config: ServerConfig,
    /// Cancelled on process shutdown; stops every connection.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, bus: EventBus, kernels: Arc<dyn KernelManager>) -> Self {
        let monitor = Arc::new(DependencyMonitor::new(&bus));
        Self {
            bus,
            registry: Arc::new(SessionRegistry::new(kernels)),
            monitor,
            notebooks: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_notebooks(mut self, notebooks: Arc<dyn NotebookManager>) -> Self {
        self.notebooks = Some(notebooks);
        self
    }
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let sockets = Router::new()
        .route("/dependencies/ws", get(dependencies_handler))
        .route("/notebooks/{notebook_id}/ws/notebook", get(notebook_handler))
        .route("/kernels/{kernel_spec}/ws/stream", get(stream_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", get(sessions_handler))
        .merge(sockets)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AccessQuery {
    token: Option<String>,
}

/// Refuse WebSocket upgrades without the configured token.
async fn require_token(
    State(state): State<Arc<AppState>>,
    Query(access): Query<AccessQuery>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.token {
        if access.token.as_deref() != Some(expected.as_str()) {
            tracing::warn!("Refused {} without a valid token", request.uri().path());
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Running kernel sessions.
async fn sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.summaries().await)
}

async fn dependencies_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (stream, sink) = split_socket(socket);
        routers::dependencies::serve(state, stream, sink).await;
    })
}

async fn notebook_handler(
    ws: WebSocketUpgrade,
    Path(notebook_id): Path<NotebookId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (stream, sink) = split_socket(socket);
        routers::notebook::serve(state, notebook_id, stream, sink).await;
    })
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(kernel_spec): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (stream, sink) = split_socket(socket);
        routers::stream::serve(state, kernel_spec, stream, sink).await;
    })
}
