use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use meshwork_protocol::{GossipMessage, GossipNode, MeshError, Parameters};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

pub struct WorkerState {
    pub node: Arc<GossipNode>,
    pub auth_token: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/gossip", post(gossip_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/status", get(status_handler))
        .route("/api/results/{uuid}", get(result_handler))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10MB
        .with_state(state)
}

fn check_auth(state: &WorkerState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if let Some(ref expected) = state.auth_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if token == expected => Ok(()),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    } else {
        Ok(())
    }
}

fn status_for(e: &MeshError) -> StatusCode {
    match e {
        MeshError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        MeshError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn gossip_handler(
    State(state): State<Arc<WorkerState>>,
    headers: HeaderMap,
    Json(message): Json<GossipMessage>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let from = message.origin().to_string();
    match state.node.handle_message(message).await {
        Ok(accepted) => Ok(Json(json!({ "accepted": accepted }))),
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "Rejected gossip");
            Err(status_for(&e))
        }
    }
}

async fn submit_job_handler(
    State(state): State<Arc<WorkerState>>,
    headers: HeaderMap,
    Json(parameters): Json<Parameters>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    match state.node.submit_job(parameters).await {
        Ok(Some(job)) => Ok(Json(json!({
            "status": "accepted",
            "uuid": job.uuid,
        }))),
        Ok(None) => Ok(Json(json!({ "status": "duplicate" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Job submission failed");
            Err(status_for(&e))
        }
    }
}

async fn status_handler(
    State(state): State<Arc<WorkerState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let uptime = Utc::now() - state.started_at;
    let mesh = state.node.status().await;
    Ok(Json(json!({
        "uptime_secs": uptime.num_seconds(),
        "mesh": mesh,
    })))
}

async fn result_handler(
    State(state): State<Arc<WorkerState>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let result = state.node.results.get(&uuid).await.ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(result)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshwork_protocol::{
        Job, LocalPeer, Location, MemoryStore, MeshSettings, Peer, PeerTransport, RelayChannel,
        RelayNode, SignalEnvelope,
    };

    struct Nowhere;

    #[async_trait]
    impl PeerTransport for Nowhere {
        async fn send(&self, _: &Peer, _: &GossipMessage) -> meshwork_protocol::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl RelayChannel for Nowhere {
        async fn send(&self, _: &RelayNode, _: &SignalEnvelope) -> meshwork_protocol::Result<()> {
            Ok(())
        }
    }

    fn state(token: Option<&str>) -> Arc<WorkerState> {
        let node = GossipNode::new(
            LocalPeer {
                uuid: "me".into(),
                location: Location::default(),
                endpoints: vec!["http://me:7435".into()],
            },
            MeshSettings::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Nowhere),
            Arc::new(Nowhere),
        );
        Arc::new(WorkerState {
            node: Arc::new(node),
            auth_token: token.map(str::to_string),
            started_at: Utc::now(),
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    fn params(v: Value) -> Parameters {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let s = state(Some("secret"));
        let err = status_handler(State(s.clone()), bearer("guess")).await.unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
        let err = status_handler(State(s.clone()), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
        assert!(status_handler(State(s), bearer("secret")).await.is_ok());
    }

    #[tokio::test]
    async fn submitted_job_is_deduplicated() {
        let s = state(None);
        let Json(first) = submit_job_handler(State(s.clone()), HeaderMap::new(), Json(params(json!({ "n": 1 }))))
            .await
            .unwrap();
        assert_eq!(first["status"], "accepted");
        let Json(second) = submit_job_handler(State(s.clone()), HeaderMap::new(), Json(params(json!({ "n": 1 }))))
            .await
            .unwrap();
        assert_eq!(second["status"], "duplicate");

        let err = submit_job_handler(State(s), HeaderMap::new(), Json(Parameters::new()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn forged_gossip_is_a_bad_request() {
        let s = state(None);
        let mut job = Job::new(params(json!({ "n": 2 })), "peer").unwrap();
        job.uuid = "forged".into();
        let err = gossip_handler(
            State(s),
            HeaderMap::new(),
            Json(GossipMessage::Job { origin: "peer".into(), job }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_result_is_not_found() {
        let s = state(None);
        let err = result_handler(State(s), HeaderMap::new(), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
