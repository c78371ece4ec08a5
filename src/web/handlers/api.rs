use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::SubmitResponse;
use crate::track::records::{Feedback, FeedbackScore, QueryOutcome, QueryTrace};
use crate::track::MetricsSummary;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitQueryRequest {
    pub question: String,
    pub user_id: Option<String>,
    /// When false and the top interpretation is confident enough, the gate
    /// auto-selects and the response carries the final outcome.
    pub interactive: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    /// Index into the interpretation list, or null to abandon.
    pub choice: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub score: FeedbackScore,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub schema_version: u64,
    pub query_count: usize,
    pub cache_entries: usize,
    pub engine_invocations: u64,
}

fn pipeline_error_response(e: PipelineError) -> (StatusCode, String) {
    let status = match &e {
        PipelineError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::UnknownQuery(_) => StatusCode::NOT_FOUND,
        PipelineError::NotPending(_) => StatusCode::CONFLICT,
        PipelineError::SelectionOutOfRange { .. } => StatusCode::BAD_REQUEST,
        PipelineError::Llm(_) | PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub async fn submit_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitQueryRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let user_id = payload.user_id.unwrap_or_else(|| "anonymous".to_string());
    let interactive = payload.interactive.unwrap_or(true);
    info!(user_id = %user_id, "query submitted");

    let response = state
        .pipeline
        .submit_query(&payload.question, &user_id, interactive)
        .await
        .map_err(pipeline_error_response)?;

    Ok(Json(response))
}

pub async fn select_interpretation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SelectRequest>,
) -> Result<Json<QueryOutcome>, (StatusCode, String)> {
    let outcome = state
        .pipeline
        .select_interpretation(id, payload.choice)
        .await
        .map_err(pipeline_error_response)?;

    Ok(Json(outcome))
}

pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FeedbackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let recorded = state
        .pipeline
        .tracker()
        .record_feedback(Feedback {
            query_id: id,
            score: payload.score,
            comment: payload.comment,
        })
        .await;

    if recorded {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("unknown query id: {}", id)))
    }
}

pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<QueryTrace>, (StatusCode, String)> {
    match state.pipeline.tracker().trace(id).await {
        Some(trace) => Ok(Json(trace)),
        None => Err((StatusCode::NOT_FOUND, format!("unknown query id: {}", id))),
    }
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSummary> {
    Json(state.pipeline.tracker().metrics_summary().await)
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
) -> Json<crate::schema::SchemaSnapshot> {
    let snapshot = state.pipeline.schema_provider().current().await;
    Json((*snapshot).clone())
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub schema_version: u64,
    pub table_count: usize,
}

pub async fn refresh_schema(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    let snapshot = state
        .pipeline
        .schema_provider()
        .refresh_from_store(&state.config.database.connection_string)
        .await
        .map_err(|e| {
            error!("schema refresh failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "schema refresh failed".to_string(),
            )
        })?;

    Ok(Json(RefreshResponse {
        schema_version: snapshot.version,
        table_count: snapshot.tables.len(),
    }))
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let schema_version = state.pipeline.schema_provider().current().await.version;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (chrono::Utc::now() - state.startup_time).num_seconds(),
        schema_version,
        query_count: state.pipeline.tracker().query_count().await,
        cache_entries: state.pipeline.cache().len().await,
        engine_invocations: state.pipeline.engine().invocations(),
    })
}
