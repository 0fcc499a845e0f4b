use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::Engine;
use crate::error::SlipstreamError;
use crate::{config, scheduler::RunState};

#[derive(Deserialize)]
struct QueueRequest {
    job: String,
    #[serde(default)]
    params: HashMap<String, String>,
    /// Insert at the front of the queue instead of the back.
    #[serde(default)]
    front: bool,
}

#[derive(Serialize)]
struct QueueResponse {
    name: String,
    number: i64,
}

#[derive(Deserialize)]
struct RunRef {
    job: String,
    number: i64,
}

#[derive(Deserialize)]
struct SetParamRequest {
    job: String,
    number: i64,
    key: String,
    value: String,
}

/// Run the control endpoint. Unlike the web front-end this is meant for
/// command line tooling and CI triggers, so it binds separately (typically
/// loopback only).
pub async fn run_rpc(addr: SocketAddr, engine: Arc<Engine>) {
    let app = Router::new()
        .route("/queue", post(queue_handler))
        .route("/abort", post(abort_handler))
        .route("/set", post(set_param_handler))
        .route("/jobs", get(jobs_handler))
        .route("/queued", get(queued_handler))
        .route("/running", get(running_handler))
        .with_state(engine);

    tracing::info!(addr = %addr, "Starting rpc server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind rpc server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Rpc server failed");
    }
}

async fn queue_handler(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<QueueResponse>, (StatusCode, String)> {
    match engine.queue_job(&req.job, req.params, req.front).await {
        Ok(number) => Ok(Json(QueueResponse {
            name: req.job,
            number,
        })),
        Err(SlipstreamError::JobNotFound(job)) => Err((
            StatusCode::NOT_FOUND,
            format!("Job not found: {job}"),
        )),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn abort_handler(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RunRef>,
) -> Json<serde_json::Value> {
    let aborted = engine.abort(&req.job, req.number).await;
    Json(json!({ "aborted": aborted }))
}

async fn set_param_handler(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SetParamRequest>,
) -> Json<serde_json::Value> {
    let set = engine
        .set_param(&req.job, req.number, req.key, req.value)
        .await;
    Json(json!({ "set": set }))
}

async fn jobs_handler(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(json!({ "jobs": config::known_jobs(&engine.settings().home) }))
}

async fn queued_handler(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    let state = engine.state.read().await;
    let queued: Vec<_> = state
        .queued
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "number": r.number,
                "result": RunState::Queued.to_string(),
            })
        })
        .collect();
    Json(json!({ "queued": queued }))
}

async fn running_handler(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    let state = engine.state.read().await;
    let running: Vec<_> = state
        .active
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "number": r.number,
                "context": r.context,
                "started": r.started_at,
            })
        })
        .collect();
    Json(json!({ "running": running }))
}
