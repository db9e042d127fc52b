//! # kindred-relay
//!
//! WebSocket relay that exposes the room-scoped signal bus to browsers and
//! to `RelayClient`. The relay never interprets a session: it checks that a
//! published message is a well-formed signal for the room it targets and
//! forwards the original text to every subscriber of that room.
//!
//! Routes:
//! - `GET /signal`: WebSocket, `{"op": ..., "d": ...}` frames
//! - `GET /health`: liveness and active room count
//! - `GET /rooms/{room_id}`: live subscriber count on this node

pub mod connection;
pub mod rooms;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use kindred_common::error::{KindredError, KindredResult};
use kindred_common::models::RoomId;
use kindred_common::validation::validate_id;
use kindred_signal::SignalTransport;
use rooms::RoomStats;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Relay state shared by every connection.
#[derive(Clone)]
pub struct RelayState {
    /// Backing bus: in-process for a single node, Redis for several.
    pub bus: Arc<dyn SignalTransport>,
    pub rooms: RoomStats,
}

impl RelayState {
    pub fn new(bus: Arc<dyn SignalTransport>) -> Self {
        Self {
            bus,
            rooms: RoomStats::default(),
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/signal", get(ws_handler))
        .route("/health", get(health))
        .route("/rooms/{room_id}", get(room_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state))
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.rooms.active_rooms().await,
    }))
}

#[derive(Debug, Serialize)]
struct RoomStatsResponse {
    room: RoomId,
    subscribers: usize,
}

async fn room_stats(
    State(state): State<Arc<RelayState>>,
    Path(room_id): Path<String>,
) -> KindredResult<Json<RoomStatsResponse>> {
    validate_id(&room_id).map_err(|message| KindredError::Validation { message })?;
    let room = RoomId::new(room_id);
    let subscribers = state.rooms.subscribers(&room).await;
    if subscribers == 0 {
        return Err(KindredError::NotFound {
            resource: format!("Room {room}"),
        });
    }
    Ok(Json(RoomStatsResponse { room, subscribers }))
}
