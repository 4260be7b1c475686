//! Fan-in coordination.
//!
//! Every scene worker reports its scene here. The store's conditional
//! increment tells exactly one caller per job that it accounted for the last
//! scene; that caller enqueues composition. Later reports for the same scene
//! re-emit the (deduplicated) compose message, so a trigger lost between the
//! store write and the enqueue is recovered.

use reel_models::{Job, JobId, JobStatus, SceneFailurePolicy};
use reel_queue::{ComposeJob, JobSink};
use reel_store::{IncrementOutcome, JobStore, SceneFailureOutcome};
use tracing::info;

use crate::error::WorkerResult;
use crate::stages::enqueue_once;

/// What the caller should take away from reporting a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInDecision {
    /// This call moved the job to `COMPOSING` and enqueued composition.
    TriggeredCompose,
    /// Counted; other scenes are still outstanding.
    Waiting,
    /// The scene had already been counted.
    AlreadyCounted,
    /// The scene failure failed the whole job.
    JobFailed,
}

pub struct FanInCoordinator<'a> {
    store: &'a dyn JobStore,
    queue: &'a dyn JobSink,
    policy: SceneFailurePolicy,
}

impl<'a> FanInCoordinator<'a> {
    pub fn new(store: &'a dyn JobStore, queue: &'a dyn JobSink, policy: SceneFailurePolicy) -> Self {
        Self { store, queue, policy }
    }

    /// Count a scene whose artifacts are written.
    pub async fn scene_completed(&self, job_id: &JobId, scene_index: u32) -> WorkerResult<FanInDecision> {
        let IncrementOutcome {
            completed_scenes,
            applied,
            first_to_reach_total,
        } = self.store.conditional_increment(job_id, scene_index).await?;

        if first_to_reach_total {
            info!(job_id = %job_id, scene_index, completed_scenes, "Last scene accounted for");
            self.trigger_compose(job_id).await?;
            return Ok(FanInDecision::TriggeredCompose);
        }
        self.settle_unapplied(job_id, scene_index, applied).await
    }

    /// Record a scene that ran out of attempts, applying the failure policy.
    pub async fn scene_exhausted(&self, job_id: &JobId, scene_index: u32, reason: &str) -> WorkerResult<FanInDecision> {
        let SceneFailureOutcome {
            applied,
            job_failed,
            first_to_reach_total,
        } = self
            .store
            .record_scene_failure(job_id, scene_index, reason, self.policy)
            .await?;

        if job_failed {
            return Ok(FanInDecision::JobFailed);
        }
        if first_to_reach_total {
            info!(job_id = %job_id, scene_index, "Last scene accounted for with a gap");
            self.trigger_compose(job_id).await?;
            return Ok(FanInDecision::TriggeredCompose);
        }
        self.settle_unapplied(job_id, scene_index, applied).await
    }

    /// An unapplied report may still belong to the scene that tripped the
    /// fan-in: a store retry after a lost reply sees its own earlier write.
    async fn settle_unapplied(&self, job_id: &JobId, scene_index: u32, applied: bool) -> WorkerResult<FanInDecision> {
        if applied {
            return Ok(FanInDecision::Waiting);
        }
        let job = self.store.get(job_id).await?;
        if self.reconfirm(&job, scene_index).await? {
            info!(job_id = %job_id, scene_index, "Fan-in already tripped by this scene, compose re-emitted");
            return Ok(FanInDecision::TriggeredCompose);
        }
        Ok(FanInDecision::AlreadyCounted)
    }

    /// A redelivered message for the scene that tripped the fan-in
    /// re-emits the compose trigger, in case the first emit was lost.
    /// Returns whether this scene owns the trigger.
    pub async fn reconfirm(&self, job: &Job, scene_index: u32) -> WorkerResult<bool> {
        if job.status != JobStatus::Composing || job.fan_in_scene != Some(scene_index) {
            return Ok(false);
        }
        self.trigger_compose(&job.job_id).await?;
        Ok(true)
    }

    async fn trigger_compose(&self, job_id: &JobId) -> WorkerResult<()> {
        enqueue_once(self.queue, ComposeJob::new(job_id.clone()).into()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_models::{GenerationConfig, RetentionPolicy};
    use reel_queue::{MemoryQueue, QueueJob};
    use reel_store::MemoryJobStore;

    async fn setup(total: u32) -> (MemoryJobStore, MemoryQueue, JobId) {
        let store = MemoryJobStore::new();
        let job = Job::new("o", "Volcanoes up close", GenerationConfig::default(), &RetentionPolicy::default());
        store.create(&job).await.unwrap();
        store.begin_scene_generation(&job.job_id, total).await.unwrap();
        (store, MemoryQueue::new(), job.job_id)
    }

    #[tokio::test]
    async fn test_only_last_scene_triggers_compose() {
        let (store, queue, id) = setup(3).await;
        let fan_in = FanInCoordinator::new(&store, &queue, SceneFailurePolicy::FailJob);

        assert_eq!(fan_in.scene_completed(&id, 2).await.unwrap(), FanInDecision::Waiting);
        assert_eq!(fan_in.scene_completed(&id, 0).await.unwrap(), FanInDecision::Waiting);
        assert_eq!(fan_in.scene_completed(&id, 0).await.unwrap(), FanInDecision::AlreadyCounted);
        assert_eq!(fan_in.scene_completed(&id, 1).await.unwrap(), FanInDecision::TriggeredCompose);

        let history = queue.history().await;
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], QueueJob::Compose(_)));
    }

    #[tokio::test]
    async fn test_reconfirm_only_for_tripping_scene() {
        let (store, queue, id) = setup(2).await;
        let fan_in = FanInCoordinator::new(&store, &queue, SceneFailurePolicy::FailJob);
        fan_in.scene_completed(&id, 0).await.unwrap();
        fan_in.scene_completed(&id, 1).await.unwrap();

        // Pretend the first compose message was lost.
        queue.drain().await;
        queue.clear_dedup(&QueueJob::Compose(ComposeJob::new(id.clone()))).await;

        let job = store.get(&id).await.unwrap();
        assert!(!fan_in.reconfirm(&job, 0).await.unwrap());
        assert!(queue.is_empty().await);
        assert!(fan_in.reconfirm(&job, 1).await.unwrap());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_report_from_tripping_scene_recovers_trigger() {
        let (store, queue, id) = setup(2).await;
        let fan_in = FanInCoordinator::new(&store, &queue, SceneFailurePolicy::FailJob);
        fan_in.scene_completed(&id, 0).await.unwrap();

        // The increment lands and trips the fan-in, but the caller never hears back.
        assert!(store.conditional_increment(&id, 1).await.unwrap().first_to_reach_total);
        assert!(queue.is_empty().await);

        assert_eq!(fan_in.scene_completed(&id, 1).await.unwrap(), FanInDecision::TriggeredCompose);
        assert_eq!(fan_in.scene_completed(&id, 0).await.unwrap(), FanInDecision::AlreadyCounted);

        let history = queue.history().await;
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], QueueJob::Compose(_)));
    }

    #[tokio::test]
    async fn test_repeated_failure_report_recovers_gap_trigger() {
        let (store, queue, id) = setup(2).await;
        let fan_in = FanInCoordinator::new(&store, &queue, SceneFailurePolicy::ComposeWithGap);
        fan_in.scene_completed(&id, 0).await.unwrap();

        store
            .record_scene_failure(&id, 1, "backend down", SceneFailurePolicy::ComposeWithGap)
            .await
            .unwrap();
        assert!(queue.is_empty().await);

        assert_eq!(
            fan_in.scene_exhausted(&id, 1, "backend down").await.unwrap(),
            FanInDecision::TriggeredCompose
        );
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_gap_policy_triggers_on_last_failure() {
        let (store, queue, id) = setup(2).await;
        let fan_in = FanInCoordinator::new(&store, &queue, SceneFailurePolicy::ComposeWithGap);

        fan_in.scene_completed(&id, 0).await.unwrap();
        assert_eq!(
            fan_in.scene_exhausted(&id, 1, "backend down").await.unwrap(),
            FanInDecision::TriggeredCompose
        );
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Composing);
    }
}
