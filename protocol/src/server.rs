//! HTTP gossip transport
//!
//! Two endpoints carry the whole protocol: `GET /api/state` returns
//! the local snapshot (pull-only), and `POST /api/gossip` accepts a
//! peer's snapshot and answers with ours, completing a push/pull
//! exchange in one request. `/health` and `/api/peers` exist for
//! operators, not for the protocol.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::MeshError;
use crate::model::MeshState;
use crate::node::MeshNode;

/// Build the gossip router around a shared node.
pub fn router(node: Arc<MeshNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/gossip", post(post_gossip))
        .route("/api/peers", get(get_peers))
        .layer(CorsLayer::permissive())
        .with_state(node)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_state(State(node): State<Arc<MeshNode>>) -> Json<MeshState> {
    Json(node.snapshot().await)
}

/// Accept a pushed snapshot, merge it, and reply with our own.
///
/// Unverifiable records inside the payload are dropped by the merge
/// path; a payload that is not a snapshot at all is rejected by the
/// JSON extractor before this handler runs.
async fn post_gossip(
    State(node): State<Arc<MeshNode>>,
    Json(remote): Json<MeshState>,
) -> Result<Json<MeshState>, ApiError> {
    node.apply_remote(remote).await?;
    Ok(Json(node.snapshot().await))
}

async fn get_peers(State(node): State<Arc<MeshNode>>) -> Json<serde_json::Value> {
    Json(json!({ "peers": node.peer_stats().await }))
}

/// Error wrapper mapping library failures onto HTTP responses.
struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::InvalidRecord(_) | MeshError::InvalidLabel(_) => StatusCode::BAD_REQUEST,
            _ => {
                warn!(error = %self.0, "inbound gossip failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}
