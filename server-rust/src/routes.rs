use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use meshwork_protocol::relay::{LookupRequest, PeerIndex, RegisterRequest, RegisterResponse};
use meshwork_protocol::{MeshError, NodePeerList, SignalEnvelope};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::RelayStatus;
use crate::state::RelayState;

pub fn create_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/api/peers/register", post(register_peer))
        .route("/api/peers/index", get(peer_index))
        .route("/api/peers/lookup", post(lookup_peers))
        .route("/api/signal", post(push_signal))
        .route("/api/signal/{peer}", get(poll_signals))
        .route("/api/status", get(status))
        .with_state(state)
}

fn check_auth(state: &RelayState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn status_for(e: &MeshError) -> StatusCode {
    match e {
        MeshError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        MeshError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn register_peer(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, StatusCode> {
    check_auth(&state, &headers)?;
    state.register(req).await.map(Json).map_err(|e| status_for(&e))
}

async fn peer_index(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<PeerIndex>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.index().await))
}

async fn lookup_peers(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<LookupRequest>,
) -> Result<Json<NodePeerList>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.lookup(&req.uuids).await))
}

async fn push_signal(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(envelope): Json<SignalEnvelope>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let target = envelope.target_peer_uuid.clone();
    match state.push_signal(envelope).await {
        Ok(()) => Ok(Json(json!({ "status": "queued" }))),
        Err(e) => {
            tracing::debug!(peer = %target, error = %e, "Signal refused");
            Err(status_for(&e))
        }
    }
}

async fn poll_signals(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(peer): Path<String>,
) -> Result<Json<Vec<SignalEnvelope>>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.drain(&peer).await))
}

async fn status(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<RelayStatus>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.status().await))
}
