//! HTTP trigger surface — runs alongside the capture pipeline.
//!
//! Endpoints:
//!   POST /save-clip   → synthesize a clip (optional JSON body)
//!   GET  /status      → per-camera buffer + worker report
//!   GET  /health      → healthy iff every worker is running and fresh

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::buffer::BufferIndex;
use crate::capture::{StatusRegistry, WorkerState};
use crate::clip::ClipAssembler;
use crate::config::Config;
use crate::error::PrerollError;
use crate::supervisor::StorageReport;

/// Shared state passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub index: Arc<BufferIndex>,
    pub registry: StatusRegistry,
    pub assembler: Arc<ClipAssembler>,
    pub storage: Arc<RwLock<StorageReport>>,
}

// ──────────────── request / response types ────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SaveClipParams {
    /// Camera id, or "ALL" (the default) for every camera.
    pub camera_id: Option<String>,
    /// Clip length in seconds; defaults to `FINAL_CLIP_DURATION`.
    pub duration: Option<u64>,
}

#[derive(Serialize)]
struct SaveClipResponse {
    success: bool,
    message: String,
    trigger_time: DateTime<Utc>,
    camera_id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    cameras: Vec<CameraReport>,
    storage: StorageReport,
}

#[derive(Serialize)]
struct CameraReport {
    camera_id: String,
    state: WorkerState,
    segments: usize,
    covered_seconds: f64,
    newest_age_seconds: Option<f64>,
    backoff_attempt: u32,
    next_retry_seconds: Option<f64>,
    quarantined: bool,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/save-clip", post(handle_save_clip))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; returns when `shutdown` fires.
pub async fn start_server(state: Arc<AppState>, port: u16, shutdown: CancellationToken) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(port, "Trigger HTTP listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind trigger HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!(error = %e, "Trigger HTTP server error");
    }
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_save_clip(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SaveClipParams>>,
) -> impl IntoResponse {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    let trigger_time = Utc::now();
    let duration = state.config.clamp_clip_duration(params.duration);

    let target = params
        .camera_id
        .filter(|id| !id.eq_ignore_ascii_case("all"));

    match target {
        Some(camera_id) => {
            if !state.config.cameras.iter().any(|c| c.id == camera_id) {
                return respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    false,
                    format!("Unknown camera '{camera_id}'"),
                    trigger_time,
                    camera_id,
                );
            }
            let deadline = crate::clip::request_deadline(duration);
            match state
                .assembler
                .save_clip_with_deadline(&camera_id, duration, trigger_time, deadline)
                .await
            {
                Ok(outcome) => respond(
                    StatusCode::OK,
                    true,
                    format!("Clip saved: {}", outcome.path.display()),
                    trigger_time,
                    camera_id,
                ),
                Err(e) => {
                    warn!(camera = camera_id, error = %e, "Clip request failed");
                    respond(error_status(&e), false, e.to_string(), trigger_time, camera_id)
                }
            }
        }
        None => {
            let results = state.assembler.clone().save_all(duration, trigger_time).await;
            let failures: Vec<&(String, crate::error::Result<crate::clip::ClipOutcome>)> =
                results.iter().filter(|(_, r)| r.is_err()).collect();

            let message = results
                .iter()
                .map(|(id, r)| match r {
                    Ok(o) => format!("{id}: saved {}", o.path.display()),
                    Err(e) => format!("{id}: {e}"),
                })
                .collect::<Vec<_>>()
                .join("; ");

            let status = if failures.is_empty() {
                StatusCode::OK
            } else if failures
                .iter()
                .all(|(_, r)| matches!(r, Err(PrerollError::InsufficientBuffer { .. })))
            {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            respond(status, failures.is_empty(), message, trigger_time, "ALL".into())
        }
    }
}

fn respond(
    status: StatusCode,
    success: bool,
    message: String,
    trigger_time: DateTime<Utc>,
    camera_id: String,
) -> axum::response::Response {
    (
        status,
        Json(SaveClipResponse {
            success,
            message,
            trigger_time,
            camera_id,
        }),
    )
        .into_response()
}

fn error_status(e: &PrerollError) -> StatusCode {
    match e {
        PrerollError::InsufficientBuffer { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Instant::now();
    let buffers = state.index.status();
    let registry = state.registry.read();

    let cameras: Vec<CameraReport> = buffers
        .into_iter()
        .map(|b| {
            let worker = registry.get(&b.camera_id);
            CameraReport {
                state: worker.map_or(WorkerState::Stopped, |w| w.state),
                backoff_attempt: worker.map_or(0, |w| w.backoff_attempt),
                next_retry_seconds: worker.and_then(|w| {
                    w.next_retry_at
                        .map(|at| at.saturating_duration_since(now).as_secs_f64())
                }),
                quarantined: worker.map_or(false, |w| w.quarantined),
                camera_id: b.camera_id,
                segments: b.segments,
                covered_seconds: b.covered_seconds,
                newest_age_seconds: b.newest_age_seconds,
            }
        })
        .collect();

    let storage = state.storage.read().clone();
    (StatusCode::OK, Json(StatusResponse { cameras, storage }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let fresh_limit = (state.config.chunk_duration * 2) as f64;
    let buffers = state.index.status();
    let registry = state.registry.read();

    let healthy = !buffers.is_empty()
        && buffers.iter().all(|b| {
            let running = registry
                .get(&b.camera_id)
                .map_or(false, |w| w.state == WorkerState::Running);
            let fresh = b.newest_age_seconds.map_or(false, |a| a < fresh_limit);
            running && fresh
        });

    if healthy {
        (StatusCode::OK, Json(serde_json::json!({ "status": "healthy" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy" })),
        )
    }
}
