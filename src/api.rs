// src/api.rs
//! HTTP surface over the pipeline and manual capture.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::ingest::capture::Capturer;
use crate::ingest::error::{CaptureError, ErrorKind, PipelineError};
use crate::ingest::pipeline::{FetchReport, OutcomeStatus, Pipeline, SourceOutcome};
use crate::ingest::types::{Article, OwnerId, SourceId};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub capturer: Arc<Capturer>,
    /// Exposed on `/metrics` when present.
    pub metrics: Option<Metrics>,
}

pub fn router(state: AppState) -> Router {
    let mut r = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/fetch", post(fetch_all))
        .route("/fetch/{source_id}", post(fetch_one))
        .route("/capture", post(capture));

    if let Some(m) = state.metrics.clone() {
        r = r.route(
            "/metrics",
            get(move || {
                let m = m.clone();
                async move { m.render() }
            }),
        );
    }

    r.layer(CorsLayer::very_permissive()).with_state(state)
}

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::SsrfRejected => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Network | ErrorKind::Parse => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, error: &str, message: String) -> Response {
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}

pub enum ApiError {
    Pipeline(PipelineError),
    Capture(CaptureError),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl From<CaptureError> for ApiError {
    fn from(e: CaptureError) -> Self {
        ApiError::Capture(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Pipeline(e @ PipelineError::SourceNotFound { .. }) => {
                error_body(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            ApiError::Pipeline(e @ PipelineError::Registry { .. }) => {
                tracing::error!(error = %e, "registry unavailable");
                error_body(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
            }
            ApiError::Capture(e @ CaptureError::Duplicate { .. }) => {
                error_body(StatusCode::CONFLICT, "duplicate", e.to_string())
            }
            ApiError::Capture(e @ CaptureError::Throttled { retry_after }) => {
                let mut resp = error_body(StatusCode::TOO_MANY_REQUESTS, "throttled", e.to_string());
                set_retry_after(&mut resp, retry_after.as_millis() as u64);
                resp
            }
            ApiError::Capture(e @ CaptureError::Extraction { .. }) => {
                error_body(StatusCode::UNPROCESSABLE_ENTITY, "extraction", e.to_string())
            }
            ApiError::Capture(e) => {
                let kind = e.kind().unwrap_or(ErrorKind::Validation);
                let label = serde_json::to_value(kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                error_body(status_for_kind(kind), &label, e.to_string())
            }
        }
    }
}

async fn fetch_all(State(state): State<AppState>) -> Result<Json<FetchReport>, ApiError> {
    Ok(Json(state.pipeline.run_all().await?))
}

#[derive(Debug, Deserialize)]
struct FetchOneParams {
    deadline_ms: Option<u64>,
}

async fn fetch_one(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Query(params): Query<FetchOneParams>,
) -> Result<Response, ApiError> {
    let deadline = params.deadline_ms.map(Duration::from_millis);
    let outcome = state
        .pipeline
        .run_one(&SourceId(source_id), deadline)
        .await?;
    Ok(outcome_response(outcome))
}

fn outcome_response(outcome: SourceOutcome) -> Response {
    let status = match &outcome.status {
        OutcomeStatus::Succeeded => StatusCode::OK,
        OutcomeStatus::Failed { kind, .. } => status_for_kind(*kind),
        OutcomeStatus::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
        OutcomeStatus::Cancelled => StatusCode::GATEWAY_TIMEOUT,
    };
    let retry_after_ms = match &outcome.status {
        OutcomeStatus::Throttled { retry_after_ms } => Some(*retry_after_ms),
        _ => None,
    };
    let mut resp = (status, Json(outcome)).into_response();
    if let Some(ms) = retry_after_ms {
        set_retry_after(&mut resp, ms);
    }
    resp
}

/// `Retry-After` in whole seconds, rounded up.
fn set_retry_after(resp: &mut Response, ms: u64) {
    if let Ok(v) = HeaderValue::from_str(&ms.div_ceil(1000).to_string()) {
        resp.headers_mut().insert(header::RETRY_AFTER, v);
    }
}

#[derive(Debug, Deserialize)]
struct CaptureReq {
    url: String,
    owner: String,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

async fn capture(
    State(state): State<AppState>,
    Json(body): Json<CaptureReq>,
) -> Result<(StatusCode, Json<Article>), ApiError> {
    let owner = OwnerId(body.owner);
    let article = match body.deadline_ms {
        Some(ms) => {
            state
                .capturer
                .capture_with_deadline(&body.url, &owner, Duration::from_millis(ms))
                .await?
        }
        None => state.capturer.capture(&body.url, &owner).await?,
    };
    Ok((StatusCode::CREATED, Json(article)))
}
