//! HTTP API over the generation pipeline.
//!
//! | Method | Path                          | Body / result                           |
//! |--------|-------------------------------|-----------------------------------------|
//! | GET    | `/health`                     | `{status, version, timestamp}`          |
//! | POST   | `/api/v1/generate`            | request → artifact + timing (sync)      |
//! | POST   | `/api/v1/jobs`                | request → `202 {job_id, state}`         |
//! | GET    | `/api/v1/jobs/{id}`           | job snapshot + timing                   |
//! | POST   | `/api/v1/jobs/{id}/cancel`    | `{job_id, outcome}`                     |
//!
//! Failures use one body shape: `{status: "error", error, kind, timestamp}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hackdeck_core::config::{GenerationRequest, PipelineSettings};
use hackdeck_core::contract::Artifact;
use hackdeck_core::error::{ErrorKind, PipelineError};
use hackdeck_core::job::{GenerationJob, JobId};
use hackdeck_core::jobs::{CancelOutcome, JobManager};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{self, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// How often finished job records are checked against the retention window.
const REAP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    NotFound(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Pipeline(PipelineError::config(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    }
}

/// Successful synchronous generation.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: JobId,
    #[serde(flatten)]
    pub artifact: Artifact,
    /// Seconds from the first stage to completion.
    pub processing_time: Option<f64>,
    pub message: String,
}

/// A job snapshot with its derived timing and progress line.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: GenerationJob,
    pub processing_time: Option<f64>,
    pub message: String,
}

impl From<GenerationJob> for JobStatusResponse {
    fn from(job: GenerationJob) -> Self {
        Self {
            processing_time: job.processing_time().map(|d| d.as_secs_f64()),
            message: job.message(),
            job,
        }
    }
}

/// JSON body whose rejections use the API error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Pipeline(e) => match e.kind() {
                ErrorKind::InvalidRepository | ErrorKind::Config => StatusCode::BAD_REQUEST,
                ErrorKind::RepositoryTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                ErrorKind::CloneFailed
                | ErrorKind::MalformedLlmResponse
                | ErrorKind::LlmRateLimit
                | ErrorKind::LlmProvider
                | ErrorKind::DeckService
                | ErrorKind::DeckServiceTimeout => StatusCode::BAD_GATEWAY,
                ErrorKind::Digest | ErrorKind::Cancelled | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, kind) = match &self {
            Self::NotFound(message) => (message.clone(), "NotFound"),
            Self::Pipeline(e) => (e.to_string(), e.kind().as_str()),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), kind, error = %message, "Request failed");
        } else {
            debug!(status = status.as_u16(), kind, error = %message, "Request rejected");
        }
        let body = json!({
            "status": "error",
            "error": message,
            "kind": kind,
            "timestamp": Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

/// Upper bound for one synchronous generation: every stage at its worst, plus slack.
pub fn request_timeout(settings: &PipelineSettings) -> Duration {
    let llm = settings.llm.timeout() * settings.llm.retry.max_attempts.max(1)
        + Duration::from_millis(
            settings.llm.retry.max_backoff_ms * u64::from(settings.llm.retry.max_attempts),
        );
    settings.clone_timeout() + settings.digest_timeout() + llm + settings.deck.timeout() * 2
        + Duration::from_secs(60)
}

pub fn router(jobs: Arc<JobManager>) -> Router {
    let timeout = request_timeout(jobs.coordinator().settings());
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/generate", post(generate))
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/{id}", get(job_status))
        .route("/api/v1/jobs/{id}/cancel", post(cancel_job))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(cors::Any)
                .allow_headers(cors::Any),
        )
        .with_state(AppState { jobs })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn generate(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<GenerationRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    info!(repo_url = %request.repo_url, "Synchronous generation requested");
    let (job, artifact) = state.jobs.coordinator().generate_job(&request).await?;
    Ok(Json(GenerateResponse {
        job_id: job.id,
        artifact,
        processing_time: job.processing_time().map(|d| d.as_secs_f64()),
        message: job.message(),
    }))
}

async fn submit_job(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<GenerationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.jobs.submit(&request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": id, "state": "CREATED" })),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Job '{raw}' not found")))
}

async fn job_status(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let id = parse_job_id(&raw)?;
    state
        .jobs
        .status(id)
        .map(|job| Json(job.into()))
        .ok_or_else(|| ApiError::NotFound(format!("Job '{id}' not found")))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&raw)?;
    let outcome = match state.jobs.cancel(id) {
        Some(CancelOutcome::Requested) => "cancellation_requested",
        Some(CancelOutcome::AlreadyFinished) => "already_finished",
        None => return Err(ApiError::NotFound(format!("Job '{id}' not found"))),
    };
    Ok(Json(json!({ "job_id": id, "outcome": outcome })))
}

/// Serve until SIGINT/SIGTERM, then cancel live jobs and wait for their cleanup.
pub async fn serve(jobs: Arc<JobManager>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(address = %addr, "Listening");

    let reaper = {
        let jobs = Arc::clone(&jobs);
        let retention = jobs.coordinator().settings().job_retention();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                jobs.reap_finished(retention);
            }
        })
    };

    let result = axum::serve(listener, router(Arc::clone(&jobs)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error");
    info!("HTTP server stopped");

    reaper.abort();
    jobs.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = wait_for_signal().await {
        warn!(error = %e, "Could not listen for shutdown signals");
        std::future::pending::<()>().await;
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
