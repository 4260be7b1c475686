//! Job submission, status and listing handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use reel_models::{GenerationRequest, Job, JobId, JobStatus};
use reel_queue::WriteScriptJob;

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Rough turnaround quoted to clients at submission.
const ESTIMATED_TURNAROUND_MINS: i64 = 10;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
}

/// The job record as clients see it.
///
/// Scene counters and `attempt_count` mirror the stored record; the rest is
/// status-specific detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub topic: String,
    pub status: JobStatus,
    /// Unknown until the script is written
    pub total_scenes: Option<u32>,
    pub completed_scenes: u32,
    pub failed_scenes: Vec<u32>,
    /// Attempts spent in the current stage
    pub attempt_count: u32,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let progress_percent = job.progress_percent();
        // Status-specific detail only; stale fields from earlier stages stay hidden.
        let failure_reason = (job.status == JobStatus::Failed)
            .then(|| job.failure_reason.clone())
            .flatten();
        let published_url = (job.status == JobStatus::Complete)
            .then(|| job.published_url.clone())
            .flatten();

        Self {
            job_id: job.job_id.to_string(),
            topic: job.topic,
            status: job.status,
            total_scenes: job.total_scenes,
            completed_scenes: job.completed_scenes,
            failed_scenes: job.failed_scenes.into_iter().collect(),
            attempt_count: job.attempt_count,
            progress_percent,
            failure_reason,
            published_url,
            created_at: job.created_at,
            updated_at: job.updated_at,
            expires_at: job.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/jobs
///
/// Returns:
/// - 202: Job accepted
/// - 400: Validation failed
/// - 401: Missing owner identity
pub async fn submit_job(
    State(state): State<AppState>,
    owner: Owner,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let (topic, config) = match state.config.submission.validate(&request) {
        Ok(valid) => valid,
        Err(e) => {
            metrics::record_submission_rejected(&e);
            return Err(e.into());
        }
    };

    let job = Job::new(owner.as_str(), topic, config, &state.config.retention);
    state.store.create(&job).await?;

    if let Err(e) = state.queue.enqueue(WriteScriptJob::new(job.job_id.clone()).into()).await {
        warn!(job_id = %job.job_id, "Failed to enqueue script stage: {}", e);
        // Leave no record stuck in PENDING_SCRIPT without a message behind it.
        if let Err(fail_err) = state.store.fail(&job.job_id, "could not be queued").await {
            warn!(job_id = %job.job_id, "Failed to mark unqueued job failed: {}", fail_err);
        }
        return Err(e.into());
    }

    info!(
        job_id = %job.job_id,
        owner_id = %job.owner_id,
        duration_secs = job.config.duration_secs,
        "Job submitted"
    );
    metrics::record_job_submitted(job.config.quality.as_str());

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.job_id.to_string(),
            status: job.status,
            created_at: job.created_at,
            estimated_completion: job.created_at + Duration::minutes(ESTIMATED_TURNAROUND_MINS),
        }),
    ))
}

/// GET /api/jobs/:job_id
///
/// Returns:
/// - 200: Job record with status detail
/// - 401: Missing owner identity
/// - 404: Job not found, expired, or owned by someone else
pub async fn get_job(
    State(state): State<AppState>,
    owner: Owner,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::bad_request("Invalid job ID format"));
    }

    let job = state.store.get(&JobId::from_string(job_id)).await?;

    // Same answer as a missing job, so ids cannot be probed.
    if job.owner_id != owner.as_str() || job.is_expired(Utc::now()) {
        return Err(ApiError::not_found("Job not found"));
    }

    Ok(Json(job.into()))
}

/// GET /api/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    owner: Owner,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<ListJobsResponse>> {
    let now = Utc::now();
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let mut jobs: Vec<Job> = state
        .store
        .list_for_owner(owner.as_str())
        .await?
        .into_iter()
        .filter(|job| !job.is_expired(now))
        .filter(|job| query.status.map_or(true, |s| job.status == s))
        .collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = jobs.len();
    let jobs = jobs.into_iter().take(limit).map(JobResponse::from).collect();

    Ok(Json(ListJobsResponse { jobs, total }))
}

fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 64
        && job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_models::{GenerationConfig, RetentionPolicy};

    #[test]
    fn test_job_id_validation() {
        assert!(is_valid_job_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("../etc/passwd"));
        assert!(!is_valid_job_id(&"a".repeat(65)));
    }

    #[test]
    fn test_response_hides_detail_of_other_statuses() {
        let mut job = Job::new("o", "topic text here", GenerationConfig::default(), &RetentionPolicy::default());
        job.status = JobStatus::GeneratingScenes;
        job.total_scenes = Some(4);
        job.completed_scenes = 1;
        job.failed_scenes.insert(2);
        job.attempt_count = 2;
        job.failure_reason = Some("old".to_string());

        let response = JobResponse::from(job);
        assert_eq!(response.progress_percent, 50);
        assert_eq!(response.total_scenes, Some(4));
        assert_eq!(response.completed_scenes, 1);
        assert_eq!(response.failed_scenes, vec![2]);
        assert_eq!(response.attempt_count, 2);
        assert!(response.failure_reason.is_none());
        assert!(response.published_url.is_none());
    }
}
