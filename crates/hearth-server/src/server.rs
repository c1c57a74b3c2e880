use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use hearth_core::auth::{AuthError, AuthVerifier};
use hearth_core::envelope::Namespace;
use hearth_engine::chat::ChatRelay;
use hearth_engine::presence::PresenceCoordinator;
use hearth_engine::push::PushNotifier;
use hearth_engine::registry::{ConnectionRegistry, STALE_TIMEOUT, SWEEP_INTERVAL};
use hearth_engine::signaling::{CallConfig, CallSignalingEngine};
use hearth_store::Database;

use crate::connection;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub call_config: CallConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9400,
            max_send_queue: 256,
            call_config: CallConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceCoordinator>,
    pub chat: Arc<ChatRelay>,
    pub calls: Arc<CallSignalingEngine>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub db: Database,
}

impl AppState {
    pub fn new(
        db: Database,
        verifier: Arc<dyn AuthVerifier>,
        push: Arc<dyn PushNotifier>,
        max_send_queue: usize,
        call_config: CallConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(max_send_queue));
        let presence = Arc::new(PresenceCoordinator::new(Arc::clone(&registry), db.clone()));
        let chat = Arc::new(ChatRelay::new(
            Arc::clone(&registry),
            db.clone(),
            Arc::clone(&presence),
            Arc::clone(&push),
        ));
        let calls = Arc::new(CallSignalingEngine::new(
            Arc::clone(&registry),
            db.clone(),
            push,
            call_config,
        ));

        Self {
            registry,
            presence,
            chat,
            calls,
            verifier,
            db,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{channel}", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    verifier: Arc<dyn AuthVerifier>,
    push: Arc<dyn PushNotifier>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(
        db,
        verifier,
        push,
        config.max_send_queue,
        config.call_config,
    );

    let sweep_state = state.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for conn in sweep_state.registry.evict_stale(STALE_TIMEOUT) {
                connection::finish_disconnect(&sweep_state, &conn);
            }
        }
    });

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "hearth server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _sweep: sweep,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweep: tokio::task::JoinHandle<()>,
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade. The token is verified before the upgrade completes so
/// unauthenticated peers never hold a socket.
async fn ws_handler(
    Path(channel): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(channel) = channel.parse::<Namespace>() else {
        return (StatusCode::NOT_FOUND, "unknown channel").into_response();
    };
    let Some(token) = query.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let identity = match state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(AuthError::InvalidToken) => {
            tracing::info!(channel = %channel, "rejected connection with invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(AuthError::Unavailable(e)) => {
            tracing::error!(error = %e, "auth backend unavailable");
            return (StatusCode::SERVICE_UNAVAILABLE, "auth unavailable").into_response();
        }
    };

    let Ok(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, identity, channel))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
    }))
}
