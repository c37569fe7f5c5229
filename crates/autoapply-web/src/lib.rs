//! Axum control surface for the application pipeline.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use autoapply_core::{Application, ApplicationStatus, AtsKind};
use autoapply_pipeline::{ControlError, ControlState, Orchestrator, PipelineStatus, SeedError, SeedReport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "autoapply-web";

const DEFAULT_APPLICATION_LIMIT: usize = 50;
const MAX_APPLICATION_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("AUTOAPPLY_HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: lookup("AUTOAPPLY_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<SeedError> for AppError {
    fn from(err: SeedError) -> Self {
        match err {
            SeedError::MissingCsv { .. } => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(err) => {
                error!(error = ?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProviderRequest {
    #[serde(default)]
    ats: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(flatten)]
    state: ControlState,
}

#[derive(Debug, Serialize)]
struct SeedResponse {
    ok: bool,
    #[serde(flatten)]
    report: SeedReport,
}

#[derive(Debug, Default, Deserialize)]
struct ApplicationsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/start", post(start_handler))
        .route("/api/stop", post(stop_handler))
        .route("/api/seed-csv", post(seed_handler))
        .route("/api/applications", get(applications_handler))
        .with_state(state)
}

pub async fn serve(config: &ServerConfig, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "control surface listening");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

/// Empty bodies are accepted and mean "no provider given".
fn parse_provider_request(body: &Bytes) -> Result<Option<AtsKind>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let request: ProviderRequest = serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("invalid request body: {err}")))?;
    request
        .ats
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| a.parse::<AtsKind>().map_err(|err| AppError::BadRequest(err.to_string())))
        .transpose()
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<PipelineStatus>, AppError> {
    Ok(Json(state.orchestrator.status().await?))
}

async fn start_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ControlResponse>, AppError> {
    let ats = parse_provider_request(&body)?;
    let control = state.orchestrator.start(ats).await?;
    Ok(Json(ControlResponse {
        ok: true,
        state: control,
    }))
}

async fn stop_handler(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(ControlResponse {
        ok: true,
        state: state.orchestrator.stop().await,
    })
}

async fn seed_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<SeedResponse>, AppError> {
    let ats = parse_provider_request(&body)?
        .ok_or_else(|| AppError::BadRequest("missing `ats`".to_string()))?;
    let report = state.orchestrator.pipeline().seed(ats).await?;
    Ok(Json(SeedResponse { ok: true, report }))
}

async fn applications_handler(
    State(state): State<AppState>,
    Query(query): Query<ApplicationsQuery>,
) -> Result<Json<Vec<Application>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ApplicationStatus>())
        .transpose()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_APPLICATION_LIMIT)
        .clamp(1, MAX_APPLICATION_LIMIT);
    let applications = state
        .orchestrator
        .pipeline()
        .store()
        .list_applications(status, limit)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(applications))
}
