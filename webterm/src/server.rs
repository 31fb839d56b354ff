use crate::gateway::{GatewayConfig, ws_handler};
use axum::extract::State;
use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use webterm_bridge::Bridge;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub gateway: Arc<GatewayConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(bridge: Bridge, gateway: GatewayConfig) -> Self {
        Self {
            bridge,
            gateway: Arc::new(gateway),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the server started.
    pub uptime: u64,
    /// Live shell sessions.
    pub sessions: usize,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/socket", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then stop accepting and let in-flight
/// requests finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled_owned().await })
        .await
}

async fn status() -> Json<Status> {
    Json(Status {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        uptime: state.started_at.elapsed().as_secs(),
        sessions: state.bridge.registry().len(),
    })
}
