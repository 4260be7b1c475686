//! The job store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reel_models::{Job, JobId, JobStatus, SceneFailurePolicy};

use crate::error::StoreResult;

/// Result of a conditional scene increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementOutcome {
    /// `completed_scenes` after the call
    pub completed_scenes: u32,
    /// False when the scene was already counted (or already failed)
    pub applied: bool,
    /// True for exactly one call per job: the one that accounted for the
    /// last scene. The job has moved to `COMPOSING` when this is set.
    pub first_to_reach_total: bool,
}

/// Result of recording a scene that exhausted its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneFailureOutcome {
    /// False when the scene was already completed or already failed
    pub applied: bool,
    /// The job moved to `FAILED` because of this call
    pub job_failed: bool,
    /// Under the gap policy, this failure accounted for the last scene
    pub first_to_reach_total: bool,
}

/// Optional fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDetails {
    pub composed_asset_ref: Option<String>,
    pub published_url: Option<String>,
    pub failure_reason: Option<String>,
}

impl StatusDetails {
    pub fn composed(asset_ref: impl Into<String>) -> Self {
        Self {
            composed_asset_ref: Some(asset_ref.into()),
            ..Default::default()
        }
    }

    pub fn published(url: impl Into<String>) -> Self {
        Self {
            published_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Durable, per-job linearizable job store.
///
/// Every mutation is either a conditional scene increment keyed by scene
/// index or a conditional status transition keyed by the expected status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: &Job) -> StoreResult<()>;

    /// Current snapshot, or `NotFound`.
    async fn get(&self, job_id: &JobId) -> StoreResult<Job>;

    /// Jobs submitted by `owner_id`, newest first.
    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Job>>;

    /// Set `total_scenes` and move `PENDING_SCRIPT -> GENERATING_SCENES`.
    ///
    /// `total_scenes` can only be set through this call, which makes it
    /// write-once.
    async fn begin_scene_generation(&self, job_id: &JobId, total_scenes: u32) -> StoreResult<Job>;

    /// Count `scene_index` as completed unless it already was.
    async fn conditional_increment(
        &self,
        job_id: &JobId,
        scene_index: u32,
    ) -> StoreResult<IncrementOutcome>;

    /// Record that `scene_index` exhausted its attempts, applying `policy`.
    async fn record_scene_failure(
        &self,
        job_id: &JobId,
        scene_index: u32,
        reason: &str,
        policy: SceneFailurePolicy,
    ) -> StoreResult<SceneFailureOutcome>;

    /// Bump the per-stage attempt counter if the job is still in `expected`.
    async fn record_attempt(&self, job_id: &JobId, expected: JobStatus) -> StoreResult<u32>;

    /// Bump the delivery attempt counter of one scene.
    async fn record_scene_attempt(&self, job_id: &JobId, scene_index: u32) -> StoreResult<u32>;

    /// Conditional transition with extra fields. Fails with `StaleState`
    /// when the job is not in `expected` and `IllegalTransition` when the
    /// pair is not in the transition table.
    async fn set_status_with(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        new: JobStatus,
        details: StatusDetails,
    ) -> StoreResult<Job>;

    /// Conditional transition.
    async fn set_status(&self, job_id: &JobId, expected: JobStatus, new: JobStatus) -> StoreResult<Job> {
        self.set_status_with(job_id, expected, new, StatusDetails::default())
            .await
    }

    /// Move a non-terminal job to `FAILED`. Returns false if it was
    /// already terminal.
    async fn fail(&self, job_id: &JobId, reason: &str) -> StoreResult<bool>;

    /// Remove every job with `expires_at <= now`, whatever its status.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>>;
}
