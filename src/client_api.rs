use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{body::Bytes, Json, Router};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::kv::{KvCommand, KvResponse};
use crate::server::Server;
use crate::service::{ApiResponse, Pending};

#[derive(Clone)]
struct ApiState {
    requests: mpsc::Sender<Pending>,
    raft: Arc<Server<KvCommand>>,
}

/// Spawn a background thread serving the HTTP front end. Requests are
/// forwarded to the service loop over `requests`.
pub fn start(addr: SocketAddr, requests: mpsc::Sender<Pending>, raft: Arc<Server<KvCommand>>) {
    thread::spawn(move || {
        let state = ApiState { requests, raft };
        match tokio::runtime::Runtime::new() {
            Ok(rt) => rt.block_on(serve(addr, state)),
            Err(e) => error!(error = %e, "client api failed to start"),
        }
    });
}

async fn serve(addr: SocketAddr, state: ApiState) {
    let app = Router::new()
        .route("/kv/{key}", get(handle_get))
        .route("/kv/{key}", put(handle_put))
        .route("/kv/{key}", delete(handle_delete))
        .route("/status", get(handle_status))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "client api bind failed");
            return;
        }
    };
    info!(%addr, "client api listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "client api server error");
    }
}

async fn handle_get(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(&state, KvCommand::Get { key }).await
}

async fn handle_put(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    let value = String::from_utf8_lossy(&body).into_owned();
    submit(&state, KvCommand::Put { key, value }).await
}

async fn handle_delete(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(&state, KvCommand::Delete { key }).await
}

async fn handle_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let raft = Arc::clone(&state.raft);
    let (term, is_leader) = tokio::task::spawn_blocking(move || raft.get_state())
        .await
        .unwrap_or((crate::types::Term::ZERO, false));
    Json(serde_json::json!({
        "term": term.get(),
        "is_leader": is_leader,
    }))
}

/// Hand a command to the service loop and wait up to 5 s for its answer.
async fn submit(state: &ApiState, command: KvCommand) -> (StatusCode, String) {
    let (reply_tx, reply_rx) = oneshot::channel::<ApiResponse>();

    if state.requests.send((command, reply_tx)).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down".into());
    }

    match tokio::time::timeout(Duration::from_secs(5), reply_rx).await {
        Ok(Ok(ApiResponse::Result(KvResponse::Ok))) => (StatusCode::OK, "ok".into()),
        Ok(Ok(ApiResponse::Result(KvResponse::Value(v)))) => (StatusCode::OK, v),
        Ok(Ok(ApiResponse::Result(KvResponse::NotFound))) => {
            (StatusCode::NOT_FOUND, String::new())
        }
        Ok(Ok(ApiResponse::NotLeader)) => (StatusCode::SERVICE_UNAVAILABLE, "not the leader".into()),
        Ok(Err(_)) | Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "timed out".into()),
    }
}
