//! `/v1/jobs*` — the abstract job-queue contract from §6
//! (`enqueue/get/list/cancel/retry/delete/events`), one thin handler per
//! `JobManager` method.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use braindrive_core::jobs::EnqueueOptions;
use braindrive_core::model::{Job, JobStatus, ProgressEvent};
use braindrive_core::store::JobListFilter;

use crate::error::AppError;
use crate::routes::user_id_header;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(enqueue).get(list))
        .route("/jobs/:id", get(get_one).delete(remove))
        .route("/jobs/:id/cancel", post(cancel))
        .route("/jobs/:id/retry", post(retry))
        .route("/jobs/:id/events", get(events))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job: Job,
    pub created: bool,
}

async fn enqueue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let user_id = user_id_header(&headers)?;
    let result = state.context.jobs.enqueue_job(
        &body.job_type,
        body.payload,
        &user_id,
        EnqueueOptions {
            priority: body.priority,
            workspace_id: body.workspace_id,
            idempotency_key: body.idempotency_key,
            max_retries: body.max_retries,
            scheduled_for: body.scheduled_for,
        },
    )?;
    Ok(Json(EnqueueResponse {
        job: result.job,
        created: result.created,
    }))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>, AppError> {
    Ok(Json(state.context.jobs.get_job(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<braindrive_core::store::JobPage>, AppError> {
    let user_id = user_id_header(&headers)?;
    let filter = JobListFilter {
        status: query.status,
        job_type: query.job_type,
    };
    Ok(Json(
        state
            .context
            .jobs
            .list_jobs(&user_id, &filter, query.page, query.page_size)?,
    ))
}

async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = user_id_header(&headers)?;
    let deleted = state.context.jobs.delete_job(&id, &user_id)?;
    if !deleted {
        return Err(AppError::NotFound);
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>, AppError> {
    Ok(Json(state.context.jobs.cancel_job(&id)?))
}

async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>, AppError> {
    Ok(Json(state.context.jobs.retry_job(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<ProgressEvent>,
    pub latest_sequence_number: u64,
}

async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, AppError> {
    let events = state.context.jobs.events(&id, query.since)?;
    let latest_sequence_number = events.last().map(|e| e.sequence_number).unwrap_or(0);
    Ok(Json(EventsResponse {
        events,
        latest_sequence_number,
    }))
}
