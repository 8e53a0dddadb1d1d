#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobq_core::store::{DefaultKv, KvSerde};
use jobq_core::{CreateOptions, JobFilter, JobStats, QueueError};
use crate::module::{Manager, Module, ModuleCtx};
use crate::scheduler::{state_key, SchedulerState};

#[derive(Clone)]
struct AppState {
    kv: DefaultKv,
    manager: Arc<Manager>,
    started: Instant,
}

#[derive(Serialize)]
struct Status {
    uptime_ms: u64,
    jobs: JobStats,
    scheduler: SchedulerState,
    handlers: Vec<String>,
    processing: Vec<String>,
}

#[derive(Deserialize)]
struct CreateBody {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    max_retries: Option<u32>,
}

pub struct WebServer {
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(addr: SocketAddr) -> Self { Self { addr } }
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let state = AppState { kv: ctx.kv.clone(), manager: ctx.manager.clone(), started: Instant::now() };
            let app = router(state);

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("web listening on http://{}", self.addr);

            // clone into a mutable receiver to await .changed()
            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            Ok(())
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/jobs", get(jobs_list).post(jobs_create))
        .route("/jobs/:id", get(jobs_get).delete(jobs_delete))
        .route("/jobs/:id/cancel", post(jobs_cancel))
        .route("/jobs/:id/logs", get(jobs_logs))
        .with_state(state)
}

fn store_error(e: QueueError) -> Response {
    warn!("web request failed err={}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let jobs = match state.manager.stats() {
        Ok(s) => s,
        Err(e) => return store_error(e),
    };
    let scheduler = state.kv.get_t::<SchedulerState>(&state_key()).ok().flatten().unwrap_or_default();
    Json(Status {
        uptime_ms: state.started.elapsed().as_millis() as u64,
        jobs,
        scheduler,
        handlers: state.manager.handler_types(),
        processing: state.manager.processing_ids(),
    })
    .into_response()
}

async fn jobs_list(State(state): State<AppState>, Query(filter): Query<JobFilter>) -> Response {
    match state.manager.get_jobs(&filter) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => store_error(e),
    }
}

async fn jobs_create(State(state): State<AppState>, Json(body): Json<CreateBody>) -> Response {
    if body.job_type.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "type must not be empty").into_response();
    }
    let opts = CreateOptions { max_retries: body.max_retries };
    match state.manager.create_job(body.job_type, body.payload, opts) {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn jobs_get(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.manager.get_job(&id) {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such job").into_response(),
        Err(e) => store_error(e),
    }
}

async fn jobs_delete(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.manager.delete_job(&id) {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn jobs_cancel(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.manager.cancel_job(&id) {
        Ok(cancelled) => Json(json!({ "cancelled": cancelled })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn jobs_logs(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.manager.get_logs(&id) {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => store_error(e),
    }
}
