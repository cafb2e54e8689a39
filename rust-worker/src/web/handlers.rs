//! Producer and admin endpoint handlers.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::admin::{Admin, QueueKind, QueueOverview};
use crate::error::QueueError;
use crate::producer::Producer;
use crate::queue::{EmailJob, Job, JobOverrides, JobStatus};

/// Default page size for failed-job listings.
const DEFAULT_FAILED_PAGE: usize = 50;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub producer: Producer,
    pub admin: Admin,
    /// Expected `X-Admin-Token`; `None` disables auth.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(producer: Producer, admin: Admin, admin_token: Option<String>) -> Self {
        Self {
            producer,
            admin,
            admin_token,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Queue errors rendered as JSON with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::JobActive(_) | QueueError::LockMismatch(_) => StatusCode::CONFLICT,
            QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Payload(_) | QueueError::Unsupported(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_unavailable() {
            error!(error = %self.0, "api_store_error");
        } else {
            warn!(status_code = status.as_u16(), error = %self.0, "api_request_rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn not_found(what: &str, id: &str) -> ApiError {
    ApiError(QueueError::NotFound(format!("{} {}", what, id)))
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check: reports 503 when the queue store cannot be reached.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.admin.get_queue_stats().await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: "ok" })),
        Err(e) => {
            error!(error = %e, "health_store_unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                }),
            )
        }
    }
}

// =============================================================================
// Producer
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueEmailRequest {
    /// Caller-chosen dedup key
    pub id: String,
    #[serde(flatten)]
    pub email: EmailJob,
    #[serde(default)]
    pub options: Option<JobOverrides>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueEmailResponse {
    pub id: String,
    /// `false` when a job with this id already existed
    pub created: bool,
}

pub async fn enqueue_email(
    State(state): State<AppState>,
    Json(req): Json<EnqueueEmailRequest>,
) -> Result<(StatusCode, Json<EnqueueEmailResponse>), ApiError> {
    let created = state
        .producer
        .enqueue_email(&req.id, &req.email, req.options)
        .await?;
    let status = if created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnqueueEmailResponse {
            id: req.id,
            created,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BulkEmail {
    pub id: String,
    #[serde(flatten)]
    pub email: EmailJob,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBulkRequest {
    #[serde(default)]
    pub priority: u32,
    pub emails: Vec<BulkEmail>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueBulkResponse {
    pub submitted: usize,
    pub created: usize,
}

pub async fn enqueue_bulk_emails(
    State(state): State<AppState>,
    Json(req): Json<EnqueueBulkRequest>,
) -> Result<(StatusCode, Json<EnqueueBulkResponse>), ApiError> {
    let submitted = req.emails.len();
    let emails = req.emails.into_iter().map(|e| (e.id, e.email)).collect();
    let created = state
        .producer
        .enqueue_bulk_emails(emails, req.priority)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueBulkResponse { submitted, created }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueCampaignRequest {
    pub campaign_id: String,
    #[serde(default)]
    pub subscriber_ids: Vec<String>,
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueCampaignResponse {
    pub job_id: String,
}

pub async fn enqueue_campaign(
    State(state): State<AppState>,
    Json(req): Json<EnqueueCampaignRequest>,
) -> Result<(StatusCode, Json<EnqueueCampaignResponse>), ApiError> {
    let job_id = state
        .producer
        .enqueue_campaign(&req.campaign_id, req.subscriber_ids, req.priority)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueCampaignResponse { job_id }),
    ))
}

// =============================================================================
// Admin
// =============================================================================

pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<QueueOverview> {
    Ok(Json(state.admin.get_queue_stats().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Job> {
    let kind: QueueKind = kind.parse()?;
    match state.admin.get_job(kind, &id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found("job", &id)),
    }
}

pub async fn remove_job(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    if state.admin.remove_job(kind, &id).await? {
        Ok(Json(json!({ "removed": id })))
    } else {
        Err(not_found("job", &id))
    }
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    let retried = state.admin.retry_job(kind, &id).await?;
    Ok(Json(json!({ "id": id, "retried": retried })))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

pub async fn failed_jobs(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<JobList> {
    let kind: QueueKind = kind.parse()?;
    let end = range
        .end
        .unwrap_or_else(|| range.start.saturating_add(DEFAULT_FAILED_PAGE - 1));
    let jobs = state.admin.get_failed_jobs(kind, range.start, end).await?;
    Ok(Json(JobList { jobs }))
}

pub async fn retry_all_failed(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    let retried = state.admin.retry_all_failed(kind).await?;
    Ok(Json(json!({ "retried": retried })))
}

pub async fn pause_queue(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    state.admin.pause(kind).await?;
    Ok(Json(json!({ "queue": kind, "paused": true })))
}

pub async fn resume_queue(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    state.admin.resume(kind).await?;
    Ok(Json(json!({ "queue": kind, "paused": false })))
}

fn default_clean_status() -> JobStatus {
    JobStatus::Completed
}

#[derive(Debug, Deserialize)]
pub struct CleanRequest {
    pub older_than_ms: u64,
    #[serde(default = "default_clean_status")]
    pub status: JobStatus,
}

pub async fn clean_queue(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(req): Json<CleanRequest>,
) -> ApiResult<Value> {
    let kind: QueueKind = kind.parse()?;
    let removed = state
        .admin
        .clean(kind, Duration::from_millis(req.older_than_ms), req.status)
        .await?;
    Ok(Json(json!({ "removed": removed, "status": req.status })))
}
