use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vitrine_model::{JobId, JobKind, JobPayload, JobRecord, JobState};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub kind: String,
    pub state: String,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub progress_percent: f64,
    pub attempts: u16,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Aggregated child progress for bulk-add parents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<BulkChildrenSummary>,
}

#[derive(Debug, Serialize)]
pub struct BulkChildrenSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
}

impl JobResponse {
    fn from_record(job: JobRecord) -> Self {
        Self {
            id: job.id.to_uuid(),
            kind: job.kind().to_string(),
            state: job.state.to_string(),
            total_items: job.total_items,
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            skipped_items: job.skipped_items,
            progress_percent: job.progress_percent(),
            attempts: job.attempts,
            error_message: job.error_message.clone(),
            can_resume: job.can_resume,
            created_at: job.created_at,
            started_at: job.started_at,
            last_progress_at: job.last_progress_at,
            completed_at: job.completed_at,
            children: None,
        }
    }
}

/// GET /api/v1/jobs/{jobId} - state and progress; bulk-add parents also
/// aggregate their children's completion.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.registry.require(JobId(id)).await?;

    let children = match &job.payload {
        JobPayload::BulkAdd(params) if !params.child_job_ids.is_empty() => {
            let mut summary = BulkChildrenSummary {
                total: params.child_job_ids.len(),
                completed: 0,
                failed: 0,
                active: 0,
            };
            for child_id in &params.child_job_ids {
                match state.registry.get(*child_id).await? {
                    Some(child) => match child.state {
                        JobState::Completed => summary.completed += 1,
                        JobState::Failed | JobState::Cancelled => {
                            summary.failed += 1
                        }
                        _ => summary.active += 1,
                    },
                    None => summary.failed += 1,
                }
            }
            Some(summary)
        }
        _ => None,
    };

    let mut response = JobResponse::from_record(job);
    response.children = children;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
    pub kind: Option<String>,
}

/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> AppResult<Json<Vec<JobResponse>>> {
    let state_filter = query
        .state
        .as_deref()
        .map(|raw| {
            JobState::parse(raw).ok_or_else(|| {
                AppError::bad_request(format!("unknown job state: {raw}"))
            })
        })
        .transpose()?;
    let kind_filter = query
        .kind
        .as_deref()
        .map(|raw| {
            JobKind::parse(raw).ok_or_else(|| {
                AppError::bad_request(format!("unknown job kind: {raw}"))
            })
        })
        .transpose()?;

    let jobs = state.registry.list(state_filter, kind_filter).await?;
    Ok(Json(
        jobs.into_iter().map(JobResponse::from_record).collect(),
    ))
}

/// POST /api/v1/jobs/{jobId}/cancel - idempotent.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.registry.cancel(JobId(id)).await?;
    Ok(Json(JobResponse::from_record(job)))
}

/// POST /api/v1/jobs/{jobId}/pause
pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.registry.pause(JobId(id)).await?;
    Ok(Json(JobResponse::from_record(job)))
}

/// POST /api/v1/jobs/{jobId}/resume - back to the queue, then to a worker.
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.registry.resume(JobId(id)).await?;
    state.pool.submit(job.id).await?;
    Ok(Json(JobResponse::from_record(job)))
}
