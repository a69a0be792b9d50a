//! HTTP API Server
//!
//! Client WebSocket endpoint plus read-only status and room queries.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::ws;
use crate::config::ApiConfig;
use crate::coordinator::DeletionTransaction;
use crate::error::{Error, Result};
use crate::node::ChatNode;
use crate::session::RoomScope;
use crate::state::{HealthStatus, HealthSummary};

/// Shared application state
pub struct AppState {
    pub node: Arc<ChatNode>,
}

/// HTTP API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server for `node`
    pub fn new(config: ApiConfig, node: Arc<ChatNode>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/ws", get(ws::handle_upgrade))
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/rooms", get(handle_rooms))
            .route("/rooms/:room_id", get(handle_room))
            .route("/peers", get(handle_peers))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub address: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    /// Rooms administered by this node
    pub rooms_administered: usize,
    /// Administered rooms plus local replicas
    pub rooms_total: usize,
    pub sessions: usize,
    pub outboxes: usize,
    pub peers: HealthSummary,
    /// Deletions this node is coordinating right now
    pub deletions_in_progress: Vec<DeletionTransaction>,
}

/// A known peer
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_id: String,
    pub address: Option<String>,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Query string of `/rooms`
#[derive(Debug, Default, Deserialize)]
pub struct RoomsQuery {
    #[serde(default)]
    pub scope: RoomScope,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::RoomNotFound(_) | Error::MemberNotFound { .. } | Error::PeerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node.node_id().to_string(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = state.node.context();
    let uptime = (Utc::now() - ctx.started_at).num_seconds().max(0) as u64;

    Json(StatusResponse {
        node_id: ctx.node_id().to_string(),
        address: ctx.advertise_address().to_string(),
        started_at: ctx.started_at,
        uptime_seconds: uptime,
        rooms_administered: ctx.store.administered_handles().await.len(),
        rooms_total: ctx.store.room_count().await,
        sessions: ctx.sessions.count(),
        outboxes: ctx.outboxes.len(),
        peers: ctx.health.summary().await,
        deletions_in_progress: state.node.deletion().active_transactions().await,
    })
}

async fn handle_rooms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomsQuery>,
) -> impl IntoResponse {
    Json(state.node.admin().list_rooms(query.scope).await)
}

async fn handle_room(State(state): State<Arc<AppState>>, Path(room_id): Path<String>) -> Response {
    match state.node.context().store.get_room(&room_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = state.node.context();
    let mut peers = Vec::new();
    for health in ctx.health.all().await {
        peers.push(PeerStatus {
            address: ctx.registry.address_of(&health.node_id).await,
            node_id: health.node_id,
            status: health.status,
            consecutive_failures: health.consecutive_failures,
            last_heartbeat_at: health.last_heartbeat_at,
        });
    }
    Json(peers)
}
