//! In-process job store.
//!
//! Each job lives in one `DashMap` entry; every operation runs while
//! holding that entry's write guard, which makes operations linearizable
//! per job while different jobs proceed independently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use reel_models::{Job, JobId, JobStatus, SceneFailurePolicy};

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::store::{IncrementOutcome, JobStore, SceneFailureOutcome, StatusDetails};

/// Job store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run `f` against the job while holding its entry lock.
    fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut Job) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found(job_id))?;
        f(entry.value_mut())
    }
}

fn check_scene_index(job: &Job, scene_index: u32) -> StoreResult<u32> {
    let total = job
        .total_scenes
        .ok_or_else(|| StoreError::precondition_failed(format!("job {} has no total_scenes", job.job_id)))?;
    if scene_index >= total {
        return Err(StoreError::precondition_failed(format!(
            "scene {} out of range for job {} with {} scenes",
            scene_index, job.job_id, total
        )));
    }
    Ok(total)
}

/// Flip `GENERATING_SCENES -> COMPOSING` if every scene is accounted for
/// and nobody has done so yet. Returns true for the caller that flipped it.
fn try_fan_in(job: &mut Job, scene_index: u32, total: u32, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::GeneratingScenes
        || job.fan_in_scene.is_some()
        || job.accounted_scenes() < total
    {
        return false;
    }
    job.fan_in_scene = Some(scene_index);
    job.status = JobStatus::Composing;
    job.attempt_count = 0;
    job.updated_at = now;
    true
}

fn mark_failed(job: &mut Job, reason: String, now: DateTime<Utc>) -> bool {
    if !job.status.can_transition_to(JobStatus::Failed) {
        return false;
    }
    job.status = JobStatus::Failed;
    job.failure_reason = Some(reason);
    job.attempt_count = 0;
    job.updated_at = now;
    true
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        match self.jobs.entry(job.job_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(job.job_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                metrics::record_operation("create", "ok");
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found(job_id))
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn begin_scene_generation(&self, job_id: &JobId, total_scenes: u32) -> StoreResult<Job> {
        if total_scenes == 0 {
            return Err(StoreError::precondition_failed("total_scenes must be positive"));
        }
        self.with_job(job_id, |job| {
            if job.status != JobStatus::PendingScript {
                return Err(StoreError::stale(JobStatus::PendingScript, job.status));
            }
            if job.total_scenes.is_some() {
                return Err(StoreError::precondition_failed("total_scenes already set"));
            }
            job.total_scenes = Some(total_scenes);
            job.status = JobStatus::GeneratingScenes;
            job.attempt_count = 0;
            job.updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    async fn conditional_increment(
        &self,
        job_id: &JobId,
        scene_index: u32,
    ) -> StoreResult<IncrementOutcome> {
        let outcome = self.with_job(job_id, |job| {
            let total = check_scene_index(job, scene_index)?;
            if job.completed_indices.contains(&scene_index) || job.failed_scenes.contains(&scene_index) {
                return Ok(IncrementOutcome {
                    completed_scenes: job.completed_scenes,
                    applied: false,
                    first_to_reach_total: false,
                });
            }

            let now = Utc::now();
            job.completed_indices.insert(scene_index);
            job.completed_scenes += 1;
            job.updated_at = now;
            let first = try_fan_in(job, scene_index, total, now);

            Ok(IncrementOutcome {
                completed_scenes: job.completed_scenes,
                applied: true,
                first_to_reach_total: first,
            })
        })?;

        if outcome.first_to_reach_total {
            metrics::record_fan_in();
            info!(job_id = %job_id, scene_index, "All scenes accounted for, job moved to COMPOSING");
        } else if !outcome.applied {
            metrics::record_duplicate_increment();
            debug!(job_id = %job_id, scene_index, "Scene already counted");
        }
        Ok(outcome)
    }

    async fn record_scene_failure(
        &self,
        job_id: &JobId,
        scene_index: u32,
        reason: &str,
        policy: SceneFailurePolicy,
    ) -> StoreResult<SceneFailureOutcome> {
        let outcome = self.with_job(job_id, |job| {
            let total = check_scene_index(job, scene_index)?;
            let mut outcome = SceneFailureOutcome {
                applied: false,
                job_failed: false,
                first_to_reach_total: false,
            };
            if job.completed_indices.contains(&scene_index) || job.failed_scenes.contains(&scene_index) {
                return Ok(outcome);
            }

            let now = Utc::now();
            job.failed_scenes.insert(scene_index);
            job.updated_at = now;
            outcome.applied = true;

            let reason = format!("scene {} failed: {}", scene_index, reason);
            match policy {
                SceneFailurePolicy::FailJob => {
                    outcome.job_failed = mark_failed(job, reason, now);
                }
                SceneFailurePolicy::ComposeWithGap => {
                    if job.accounted_scenes() >= total && job.completed_scenes == 0 {
                        outcome.job_failed = mark_failed(job, "all scenes failed".to_string(), now);
                    } else {
                        outcome.first_to_reach_total = try_fan_in(job, scene_index, total, now);
                    }
                }
            }
            Ok(outcome)
        })?;

        if outcome.first_to_reach_total {
            metrics::record_fan_in();
        }
        Ok(outcome)
    }

    async fn record_attempt(&self, job_id: &JobId, expected: JobStatus) -> StoreResult<u32> {
        self.with_job(job_id, |job| {
            if job.status != expected {
                return Err(StoreError::stale(expected, job.status));
            }
            job.attempt_count += 1;
            job.updated_at = Utc::now();
            Ok(job.attempt_count)
        })
    }

    async fn record_scene_attempt(&self, job_id: &JobId, scene_index: u32) -> StoreResult<u32> {
        self.with_job(job_id, |job| {
            check_scene_index(job, scene_index)?;
            let attempts = job.scene_attempts.entry(scene_index).or_insert(0);
            *attempts += 1;
            Ok(*attempts)
        })
    }

    async fn set_status_with(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        new: JobStatus,
        details: StatusDetails,
    ) -> StoreResult<Job> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::IllegalTransition { from: expected, to: new });
        }
        let result = self.with_job(job_id, |job| {
            if job.status != expected {
                return Err(StoreError::stale(expected, job.status));
            }
            job.status = new;
            job.attempt_count = 0;
            job.updated_at = Utc::now();
            if let Some(asset) = details.composed_asset_ref {
                job.composed_asset_ref = Some(asset);
            }
            if let Some(url) = details.published_url {
                job.published_url = Some(url);
            }
            if let Some(reason) = details.failure_reason {
                job.failure_reason = Some(reason);
            }
            Ok(job.clone())
        });

        match &result {
            Ok(_) => metrics::record_operation("set_status", "ok"),
            Err(e) if e.is_stale() => metrics::record_operation("set_status", "stale"),
            Err(_) => metrics::record_operation("set_status", "error"),
        }
        result
    }

    async fn fail(&self, job_id: &JobId, reason: &str) -> StoreResult<bool> {
        self.with_job(job_id, |job| Ok(mark_failed(job, reason.to_string(), Utc::now())))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for job_id in expired {
            // Re-check under the entry lock.
            if self.jobs.remove_if(&job_id, |_, job| job.is_expired(now)).is_some() {
                removed.push(job_id);
            }
        }
        metrics::record_expired(removed.len());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reel_models::{GenerationConfig, RetentionPolicy};
    use std::sync::Arc;

    fn new_job() -> Job {
        Job::new("owner-1", "The life of bees", GenerationConfig::default(), &RetentionPolicy::default())
    }

    async fn generating(store: &MemoryJobStore, total: u32) -> JobId {
        let job = new_job();
        store.create(&job).await.unwrap();
        store.begin_scene_generation(&job.job_id, total).await.unwrap();
        job.job_id
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();

        assert!(matches!(store.create(&job).await, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.get(&job.job_id).await.unwrap(), job);
        assert!(store.get(&JobId::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_total_scenes_is_write_once() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 3).await;

        let err = store.begin_scene_generation(&job_id, 5).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(store.get(&job_id).await.unwrap().total_scenes, Some(3));
    }

    #[tokio::test]
    async fn test_out_of_order_completion_triggers_once() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 3).await;

        let two = store.conditional_increment(&job_id, 2).await.unwrap();
        let zero = store.conditional_increment(&job_id, 0).await.unwrap();
        let one = store.conditional_increment(&job_id, 1).await.unwrap();

        assert!(!two.first_to_reach_total);
        assert!(!zero.first_to_reach_total);
        assert!(one.first_to_reach_total);
        assert_eq!(one.completed_scenes, 3);

        let job = store.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Composing);
        assert_eq!(job.fan_in_scene, Some(1));
    }

    #[tokio::test]
    async fn test_redelivered_increment_is_idempotent() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 2).await;

        let first = store.conditional_increment(&job_id, 0).await.unwrap();
        let again = store.conditional_increment(&job_id, 0).await.unwrap();
        assert!(first.applied);
        assert!(!again.applied);
        assert_eq!(again.completed_scenes, 1);

        store.conditional_increment(&job_id, 1).await.unwrap();
        let late = store.conditional_increment(&job_id, 1).await.unwrap();
        assert!(!late.first_to_reach_total);
        assert_eq!(late.completed_scenes, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_trigger_exactly_once() {
        for total in [1u32, 3, 8] {
            let store = Arc::new(MemoryJobStore::new());
            let job_id = generating(&store, total).await;

            // Every scene delivered three times, all racing.
            let mut handles = Vec::new();
            for round in 0..3 {
                for scene in 0..total {
                    let store = Arc::clone(&store);
                    let job_id = job_id.clone();
                    handles.push(tokio::spawn(async move {
                        if round % 2 == 1 {
                            tokio::task::yield_now().await;
                        }
                        store.conditional_increment(&job_id, scene).await.unwrap()
                    }));
                }
            }

            let mut triggers = 0;
            for handle in handles {
                if handle.await.unwrap().first_to_reach_total {
                    triggers += 1;
                }
            }
            assert_eq!(triggers, 1, "total_scenes = {}", total);
            assert_eq!(store.get(&job_id).await.unwrap().completed_scenes, total);
        }
    }

    #[tokio::test]
    async fn test_increment_rejects_unknown_scene() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();

        let err = store.conditional_increment(&job.job_id, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        store.begin_scene_generation(&job.job_id, 2).await.unwrap();
        let err = store.conditional_increment(&job.job_id, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_scene_failure_fails_job_and_blocks_fan_in() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 2).await;

        store.conditional_increment(&job_id, 0).await.unwrap();
        let outcome = store
            .record_scene_failure(&job_id, 1, "backend timeout", SceneFailurePolicy::FailJob)
            .await
            .unwrap();
        assert!(outcome.job_failed);
        assert!(!outcome.first_to_reach_total);

        let job = store.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("scene 1"));

        let late = store.conditional_increment(&job_id, 1).await.unwrap();
        assert!(!late.applied);
        assert!(!late.first_to_reach_total);
    }

    #[tokio::test]
    async fn test_gap_policy_counts_failure_toward_total() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 3).await;

        store.conditional_increment(&job_id, 0).await.unwrap();
        store.conditional_increment(&job_id, 2).await.unwrap();
        let outcome = store
            .record_scene_failure(&job_id, 1, "bad prompt", SceneFailurePolicy::ComposeWithGap)
            .await
            .unwrap();
        assert!(outcome.first_to_reach_total);

        let job = store.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Composing);
        assert_eq!(job.composable_scenes(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_gap_policy_with_every_scene_failed() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 1).await;

        let outcome = store
            .record_scene_failure(&job_id, 0, "nope", SceneFailurePolicy::ComposeWithGap)
            .await
            .unwrap();
        assert!(outcome.job_failed);
        assert!(!outcome.first_to_reach_total);
    }

    #[tokio::test]
    async fn test_set_status_is_conditional() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 1).await;
        store.conditional_increment(&job_id, 0).await.unwrap();

        let job = store
            .set_status_with(
                &job_id,
                JobStatus::Composing,
                JobStatus::Publishing,
                StatusDetails::composed("jobs/x/final.mp4"),
            )
            .await
            .unwrap();
        assert_eq!(job.composed_asset_ref.as_deref(), Some("jobs/x/final.mp4"));

        let err = store
            .set_status(&job_id, JobStatus::Composing, JobStatus::Publishing)
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let err = store
            .set_status(&job_id, JobStatus::Publishing, JobStatus::Composing)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_is_final() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 2).await;

        assert!(store.fail(&job_id, "gave up").await.unwrap());
        assert!(!store.fail(&job_id, "again").await.unwrap());
        for next in JobStatus::ALL {
            assert!(store.set_status(&job_id, JobStatus::Failed, next).await.is_err());
        }
        assert_eq!(store.get(&job_id).await.unwrap().failure_reason.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn test_attempt_counters() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.create(&job).await.unwrap();

        assert_eq!(store.record_attempt(&job.job_id, JobStatus::PendingScript).await.unwrap(), 1);
        assert_eq!(store.record_attempt(&job.job_id, JobStatus::PendingScript).await.unwrap(), 2);
        assert!(store
            .record_attempt(&job.job_id, JobStatus::Composing)
            .await
            .unwrap_err()
            .is_stale());

        store.begin_scene_generation(&job.job_id, 2).await.unwrap();
        assert_eq!(store.get(&job.job_id).await.unwrap().attempt_count, 0);
        assert_eq!(store.record_scene_attempt(&job.job_id, 1).await.unwrap(), 1);
        assert_eq!(store.record_scene_attempt(&job.job_id, 1).await.unwrap(), 2);
        assert_eq!(store.record_scene_attempt(&job.job_id, 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_in_flight_jobs() {
        let store = MemoryJobStore::new();
        let job_id = generating(&store, 4).await;
        let fresh = new_job();
        store.create(&fresh).await.unwrap();

        let expires_at = store.get(&job_id).await.unwrap().expires_at;
        let removed = store.sweep_expired(expires_at).await.unwrap();

        // Both jobs share a retention window; the later one may survive by
        // a few microseconds, the in-flight one must go.
        assert!(removed.contains(&job_id));
        assert!(store.get(&job_id).await.unwrap_err().is_not_found());

        let removed = store.sweep_expired(Utc::now() + Duration::days(30)).await.unwrap();
        assert!(removed.contains(&fresh.job_id));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_for_owner() {
        let store = MemoryJobStore::new();
        let mine = new_job();
        let other = Job::new("owner-2", "Another topic here", GenerationConfig::default(), &RetentionPolicy::default());
        store.create(&mine).await.unwrap();
        store.create(&other).await.unwrap();

        let jobs = store.list_for_owner("owner-1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, mine.job_id);
    }
}
