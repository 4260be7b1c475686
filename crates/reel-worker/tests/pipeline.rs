//! End-to-end stage scenarios against in-process store, queue and storage.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use reel_genai::{
    GenaiError, GenaiResult, GeneratedScene, PublishMetadata, PublishedVideo, Publisher, SceneGenerator,
    ScriptWriter,
};
use reel_media::{Composer, MediaResult, SceneMedia};
use reel_models::{
    GenerationConfig, GenerationParams, Job, JobId, JobStatus, RetentionPolicy, SceneFailurePolicy, Script,
    ScriptScene, VideoFormat,
};
use reel_queue::{ComposeJob, JobSink, MemoryQueue, QueueError, QueueJob, QueueResult, WriteScriptJob};
use reel_storage::{artifacts, ArtifactStore, MemoryArtifactStore};
use reel_store::{
    IncrementOutcome, JobStore, MemoryJobStore, SceneFailureOutcome, StatusDetails, StoreResult,
};
use reel_worker::{run_stage, PipelineContext, StageOutcome, WorkerConfig, WorkerResult};

// ---------------------------------------------------------------------------
// Fake backends
// ---------------------------------------------------------------------------

struct FakeScriptWriter {
    scenes: u32,
    calls: AtomicUsize,
}

#[async_trait]
impl ScriptWriter for FakeScriptWriter {
    async fn write_script(&self, topic: &str, _config: &GenerationConfig) -> GenaiResult<Script> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Script {
            title: format!("All about {topic}"),
            summary: "A short explainer".to_string(),
            hashtags: vec!["explainer".to_string()],
            scenes: (0..self.scenes)
                .map(|i| ScriptScene {
                    description: format!("scene {i}"),
                    narration: (i % 2 == 0).then(|| format!("narration {i}")),
                    duration_secs: 5,
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct FakeSceneGenerator {
    calls: Mutex<Vec<String>>,
    /// Prompts answered with a 503
    flaky: Mutex<HashSet<String>>,
    /// Prompts answered with a 400
    rejected: Mutex<HashSet<String>>,
}

impl FakeSceneGenerator {
    fn calls_for(&self, prompt: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| *p == prompt).count()
    }
}

#[async_trait]
impl SceneGenerator for FakeSceneGenerator {
    async fn generate_scene(&self, params: &GenerationParams, _format: VideoFormat) -> GenaiResult<GeneratedScene> {
        self.calls.lock().unwrap().push(params.prompt.clone());
        if self.flaky.lock().unwrap().contains(&params.prompt) {
            return Err(GenaiError::Status {
                status: 503,
                body: "overloaded".to_string(),
            });
        }
        if self.rejected.lock().unwrap().contains(&params.prompt) {
            return Err(GenaiError::Status {
                status: 400,
                body: "prompt rejected".to_string(),
            });
        }
        Ok(GeneratedScene {
            video: format!("video:{}", params.prompt).into_bytes(),
            audio: params.narration.as_ref().map(|n| n.clone().into_bytes()),
        })
    }
}

/// Concatenates the scene video files, recording what it was given.
#[derive(Default)]
struct FakeComposer {
    compositions: Mutex<Vec<Vec<String>>>,
}

impl FakeComposer {
    fn calls(&self) -> usize {
        self.compositions.lock().unwrap().len()
    }
}

#[async_trait]
impl Composer for FakeComposer {
    async fn compose(&self, scenes: &[SceneMedia], _format: VideoFormat, output: &Path) -> MediaResult<()> {
        let mut parts = Vec::new();
        for scene in scenes {
            parts.push(String::from_utf8_lossy(&tokio::fs::read(&scene.video).await?).into_owned());
        }
        tokio::task::yield_now().await;
        tokio::fs::write(output, parts.join("|")).await?;
        self.compositions.lock().unwrap().push(parts);
        Ok(())
    }
}

#[derive(Default)]
struct FakePublisher {
    uploads: Mutex<Vec<(String, PublishMetadata)>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, video: &Path, metadata: &PublishMetadata) -> GenaiResult<PublishedVideo> {
        let content = String::from_utf8_lossy(&tokio::fs::read(video).await?).into_owned();
        self.uploads.lock().unwrap().push((content, metadata.clone()));
        Ok(PublishedVideo {
            platform_id: "vid-1".to_string(),
            url: "https://www.youtube.com/watch?v=vid-1".to_string(),
        })
    }
}

/// Counts every enqueue attempt by stage, including deduplicated ones.
struct CountingSink {
    inner: Arc<MemoryQueue>,
    attempts: Mutex<HashMap<&'static str, usize>>,
    /// Stages whose next enqueue fails like a dropped connection
    fail_next: Mutex<HashSet<&'static str>>,
}

impl CountingSink {
    fn attempts(&self, stage: &str) -> usize {
        self.attempts.lock().unwrap().get(stage).copied().unwrap_or(0)
    }

    fn fail_next(&self, stage: &'static str) {
        self.fail_next.lock().unwrap().insert(stage);
    }
}

#[async_trait]
impl JobSink for CountingSink {
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        *self.attempts.lock().unwrap().entry(job.stage()).or_insert(0) += 1;
        if self.fail_next.lock().unwrap().remove(job.stage()) {
            return Err(QueueError::enqueue_failed("connection reset"));
        }
        self.inner.enqueue(job).await
    }
}

/// While `replay` is set, conditional writes run twice and report the second
/// result, like a client that retries after the first reply was dropped.
struct ReplayingStore {
    inner: Arc<MemoryJobStore>,
    replay: AtomicBool,
}

impl ReplayingStore {
    fn replaying(&self) -> bool {
        self.replay.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for ReplayingStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        self.inner.get(job_id).await
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Job>> {
        self.inner.list_for_owner(owner_id).await
    }

    async fn begin_scene_generation(&self, job_id: &JobId, total_scenes: u32) -> StoreResult<Job> {
        self.inner.begin_scene_generation(job_id, total_scenes).await
    }

    async fn conditional_increment(&self, job_id: &JobId, scene_index: u32) -> StoreResult<IncrementOutcome> {
        if self.replaying() {
            self.inner.conditional_increment(job_id, scene_index).await?;
        }
        self.inner.conditional_increment(job_id, scene_index).await
    }

    async fn record_scene_failure(
        &self,
        job_id: &JobId,
        scene_index: u32,
        reason: &str,
        policy: SceneFailurePolicy,
    ) -> StoreResult<SceneFailureOutcome> {
        if self.replaying() {
            self.inner.record_scene_failure(job_id, scene_index, reason, policy).await?;
        }
        self.inner.record_scene_failure(job_id, scene_index, reason, policy).await
    }

    async fn record_attempt(&self, job_id: &JobId, expected: JobStatus) -> StoreResult<u32> {
        self.inner.record_attempt(job_id, expected).await
    }

    async fn record_scene_attempt(&self, job_id: &JobId, scene_index: u32) -> StoreResult<u32> {
        self.inner.record_scene_attempt(job_id, scene_index).await
    }

    async fn set_status_with(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        new: JobStatus,
        details: StatusDetails,
    ) -> StoreResult<Job> {
        if self.replaying() {
            self.inner.set_status_with(job_id, expected, new, details.clone()).await?;
        }
        self.inner.set_status_with(job_id, expected, new, details).await
    }

    async fn fail(&self, job_id: &JobId, reason: &str) -> StoreResult<bool> {
        self.inner.fail(job_id, reason).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        self.inner.sweep_expired(now).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    ctx: PipelineContext,
    store: Arc<MemoryJobStore>,
    replaying: Arc<ReplayingStore>,
    queue: Arc<MemoryQueue>,
    sink: Arc<CountingSink>,
    artifacts: Arc<MemoryArtifactStore>,
    writer: Arc<FakeScriptWriter>,
    generator: Arc<FakeSceneGenerator>,
    composer: Arc<FakeComposer>,
    publisher: Arc<FakePublisher>,
    _work: TempDir,
}

impl Harness {
    fn new(scenes: u32) -> Self {
        Self::with_policy(scenes, SceneFailurePolicy::FailJob)
    }

    fn with_policy(scenes: u32, policy: SceneFailurePolicy) -> Self {
        let work = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            work_dir: work.path().to_string_lossy().into_owned(),
            max_retry_attempts: 3,
            scene_failure_policy: policy,
            ..WorkerConfig::default()
        };

        let store = Arc::new(MemoryJobStore::new());
        let replaying = Arc::new(ReplayingStore {
            inner: Arc::clone(&store),
            replay: AtomicBool::new(false),
        });
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(CountingSink {
            inner: Arc::clone(&queue),
            attempts: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(HashSet::new()),
        });
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let writer = Arc::new(FakeScriptWriter {
            scenes,
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(FakeSceneGenerator::default());
        let composer = Arc::new(FakeComposer::default());
        let publisher = Arc::new(FakePublisher::default());

        let ctx = PipelineContext {
            config,
            store: replaying.clone(),
            queue: sink.clone(),
            artifacts: artifacts.clone(),
            script_writer: writer.clone(),
            scene_generator: generator.clone(),
            composer: composer.clone(),
            publisher: publisher.clone(),
        };

        Self {
            ctx,
            store,
            replaying,
            queue,
            sink,
            artifacts,
            writer,
            generator,
            composer,
            publisher,
            _work: work,
        }
    }

    async fn submit(&self) -> JobId {
        let job = Job::new(
            "owner-1",
            "how bees make honey",
            GenerationConfig::default(),
            &RetentionPolicy::default(),
        );
        self.store.create(&job).await.unwrap();
        self.ctx
            .queue
            .enqueue(WriteScriptJob::new(job.job_id.clone()).into())
            .await
            .unwrap();
        job.job_id
    }

    async fn job(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap()
    }

    async fn run(&self, msg: &QueueJob) -> WorkerResult<StageOutcome> {
        run_stage(&self.ctx, msg).await
    }

    /// Deliver the next message until it settles, redelivering after
    /// retryable failures like the transport would.
    async fn deliver_next(&self) -> Option<(QueueJob, StageOutcome)> {
        let (_, msg) = self.queue.pop().await?;
        for _ in 0..20 {
            match self.run(&msg).await {
                Ok(outcome) => return Some((msg, outcome)),
                Err(e) if e.is_retryable() => continue,
                Err(e) => panic!("unexpected permanent error: {e}"),
            }
        }
        panic!("message never settled");
    }

    async fn run_to_idle(&self) {
        while self.deliver_next().await.is_some() {}
    }

    /// Run the script stage and return the fan-out messages, in order.
    async fn fan_out(&self) -> (JobId, Vec<QueueJob>) {
        let id = self.submit().await;
        let (msg, outcome) = self.deliver_next().await.unwrap();
        assert!(matches!(msg, QueueJob::WriteScript(_)));
        assert_eq!(outcome, StageOutcome::Advanced);
        let scenes = self.queue.drain().await.into_iter().map(|(_, m)| m).collect();
        (id, scenes)
    }

    async fn compose_enqueued(&self) -> usize {
        self.queue
            .history()
            .await
            .iter()
            .filter(|m| matches!(m, QueueJob::Compose(_)))
            .count()
    }

    async fn publish_enqueued(&self) -> usize {
        self.queue
            .history()
            .await
            .iter()
            .filter(|m| matches!(m, QueueJob::Publish(_)))
            .count()
    }
}

fn scene_index(msg: &QueueJob) -> u32 {
    match msg {
        QueueJob::GenerateScene(scene) => scene.scene_index,
        other => panic!("not a scene message: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_reaches_complete() {
    let h = Harness::new(3);
    let id = h.submit().await;
    h.run_to_idle().await;

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.total_scenes, Some(3));
    assert_eq!(job.completed_scenes, 3);
    assert_eq!(job.published_url.as_deref(), Some("https://www.youtube.com/watch?v=vid-1"));
    assert_eq!(job.composed_asset_ref, Some(artifacts::composed_key(&id)));

    assert_eq!(h.composer.calls(), 1);
    let uploads = h.publisher.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "video:scene 0|video:scene 1|video:scene 2");
    assert_eq!(uploads[0].1.title, "All about how bees make honey");
    assert!(h.artifacts.exists(&artifacts::publish_receipt_key(&id)).await.unwrap());
}

#[tokio::test]
async fn test_out_of_order_completion_composes_once_in_scene_order() {
    let h = Harness::new(3);
    let (id, scenes) = h.fan_out().await;
    assert_eq!(scenes.len(), 3);

    for index in [2usize, 0] {
        assert_eq!(h.run(&scenes[index]).await.unwrap(), StageOutcome::Advanced);
        let job = h.job(&id).await;
        assert_eq!(job.status, JobStatus::GeneratingScenes);
        assert_eq!(h.compose_enqueued().await, 0);
    }

    h.run(&scenes[1]).await.unwrap();
    let job = h.job(&id).await;
    assert_eq!(job.completed_scenes, 3);
    assert_eq!(job.status, JobStatus::Composing);
    assert_eq!(job.fan_in_scene, Some(1));
    assert_eq!(h.compose_enqueued().await, 1);

    h.run_to_idle().await;
    assert_eq!(h.composer.calls(), 1);
    assert_eq!(
        h.composer.compositions.lock().unwrap()[0],
        vec!["video:scene 0", "video:scene 1", "video:scene 2"]
    );
}

#[tokio::test]
async fn test_redelivered_scene_is_not_counted_twice() {
    let h = Harness::new(3);
    let (id, scenes) = h.fan_out().await;

    h.run(&scenes[0]).await.unwrap();
    let outcome = h.run(&scenes[0]).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Skipped(_)));

    let job = h.job(&id).await;
    assert_eq!(job.completed_scenes, 1);
    assert_eq!(h.generator.calls_for("scene 0"), 1);
}

#[tokio::test]
async fn test_concurrent_scene_completions_trigger_compose_once() {
    let h = Arc::new(Harness::new(6));
    let (id, scenes) = h.fan_out().await;

    let mut handles = Vec::new();
    for msg in scenes.iter().chain(scenes.iter()).cloned() {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move { h.run(&msg).await.unwrap() }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let job = h.job(&id).await;
    assert_eq!(job.completed_scenes, 6);
    assert_eq!(job.status, JobStatus::Composing);
    assert_eq!(h.compose_enqueued().await, 1);
}

#[tokio::test]
async fn test_scene_exhausting_retries_fails_job_without_compose() {
    let h = Harness::new(3);
    let (id, scenes) = h.fan_out().await;
    h.generator.flaky.lock().unwrap().insert("scene 1".to_string());

    h.run(&scenes[0]).await.unwrap();
    h.run(&scenes[2]).await.unwrap();

    for _ in 0..3 {
        let err = h.run(&scenes[1]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.job(&id).await.status, JobStatus::GeneratingScenes);
    }

    let outcome = h.run(&scenes[1]).await.unwrap();
    assert!(matches!(outcome, StageOutcome::GaveUp(_)));
    assert_eq!(h.generator.calls_for("scene 1"), 3);

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failed_scenes.contains(&1));
    assert!(job.failure_reason.unwrap().contains("scene 1"));
    assert_eq!(h.compose_enqueued().await, 0);
    assert_eq!(h.composer.calls(), 0);

    // Late deliveries after the failure are dropped.
    assert!(matches!(h.run(&scenes[1]).await.unwrap(), StageOutcome::Skipped(_)));
}

#[tokio::test]
async fn test_gap_policy_composes_without_failed_scene() {
    let h = Harness::with_policy(3, SceneFailurePolicy::ComposeWithGap);
    let id = h.submit().await;
    h.generator.rejected.lock().unwrap().insert("scene 1".to_string());
    h.run_to_idle().await;

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.failed_scenes.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(
        h.composer.compositions.lock().unwrap()[0],
        vec!["video:scene 0", "video:scene 2"]
    );
}

#[tokio::test]
async fn test_permanent_scene_error_fails_job_immediately() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    h.generator.rejected.lock().unwrap().insert("scene 0".to_string());

    let outcome = h.run(&scenes[0]).await.unwrap();
    assert!(matches!(outcome, StageOutcome::GaveUp(_)));
    assert_eq!(h.generator.calls_for("scene 0"), 1);
    assert_eq!(h.job(&id).await.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_duplicate_compose_after_success_is_a_no_op() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    for msg in &scenes {
        h.run(msg).await.unwrap();
    }

    let compose: QueueJob = ComposeJob::new(id.clone()).into();
    assert_eq!(h.run(&compose).await.unwrap(), StageOutcome::Advanced);
    assert_eq!(h.job(&id).await.status, JobStatus::Publishing);

    let writes = h.artifacts.write_count();
    let outcome = h.run(&compose).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Skipped(_)));
    assert_eq!(h.artifacts.write_count(), writes);
    assert_eq!(h.composer.calls(), 1);
    assert_eq!(h.job(&id).await.status, JobStatus::Publishing);
    assert_eq!(h.sink.attempts("publish"), 2);
    assert_eq!(h.publish_enqueued().await, 1);
}

#[tokio::test]
async fn test_racing_compose_invocations_advance_once() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    for msg in &scenes {
        h.run(msg).await.unwrap();
    }

    let compose: QueueJob = ComposeJob::new(id.clone()).into();
    let (a, b) = tokio::join!(h.run(&compose), h.run(&compose));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| **o == StageOutcome::Advanced).count(), 1);
    assert_eq!(h.publish_enqueued().await, 1);
    assert_eq!(h.job(&id).await.status, JobStatus::Publishing);

    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);
    assert_eq!(h.publisher.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_publish_enqueue_is_recovered_by_compose_redelivery() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    for msg in &scenes {
        h.run(msg).await.unwrap();
    }

    // The status write commits, then the publish enqueue fails.
    h.sink.fail_next("publish");
    let compose: QueueJob = ComposeJob::new(id.clone()).into();
    let err = h.run(&compose).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.job(&id).await.status, JobStatus::Publishing);
    assert_eq!(h.publish_enqueued().await, 0);

    let outcome = h.run(&compose).await.unwrap();
    assert_eq!(outcome, StageOutcome::Skipped("job already publishing"));
    assert_eq!(h.publish_enqueued().await, 1);
    assert_eq!(h.composer.calls(), 1);

    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);
    assert_eq!(h.publisher.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_lost_compose_trigger_is_reemitted_by_tripping_scene() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    h.run(&scenes[1]).await.unwrap();
    h.run(&scenes[0]).await.unwrap();
    assert_eq!(h.job(&id).await.fan_in_scene, Some(0));

    // The compose message was lost before anyone consumed it.
    let lost = h.queue.drain().await;
    assert_eq!(lost.len(), 1);
    h.queue.clear_dedup(&lost[0].1).await;

    // A redelivery of the other scene does nothing...
    h.run(&scenes[1]).await.unwrap();
    assert!(h.queue.is_empty().await);

    // ...the scene that tripped the fan-in re-emits the trigger.
    h.run(&scenes[0]).await.unwrap();
    assert_eq!(h.queue.len().await, 1);

    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);
    assert_eq!(h.composer.calls(), 1);
}

#[tokio::test]
async fn test_last_scene_increment_replayed_after_lost_reply_still_composes() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    h.run(&scenes[0]).await.unwrap();

    h.replaying.replay.store(true, Ordering::SeqCst);
    assert_eq!(h.run(&scenes[1]).await.unwrap(), StageOutcome::Advanced);
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Composing);
    assert_eq!(job.fan_in_scene, Some(1));
    assert_eq!(h.compose_enqueued().await, 1);

    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);
    assert_eq!(h.composer.calls(), 1);
}

#[tokio::test]
async fn test_compose_status_write_replayed_after_lost_reply_still_publishes() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    for msg in &scenes {
        h.run(msg).await.unwrap();
    }

    h.replaying.replay.store(true, Ordering::SeqCst);
    let compose: QueueJob = ComposeJob::new(id.clone()).into();
    let outcome = h.run(&compose).await.unwrap();
    assert_eq!(outcome, StageOutcome::Skipped("job already publishing"));
    assert_eq!(h.publish_enqueued().await, 1);

    h.replaying.replay.store(false, Ordering::SeqCst);
    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);
    assert_eq!(h.publisher.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_script_redelivery_refills_missing_fan_out() {
    let h = Harness::new(3);
    let (id, scenes) = h.fan_out().await;

    // Scene 2's message never made it onto the queue.
    h.queue.clear_dedup(&scenes[2]).await;

    let outcome = h.run(&WriteScriptJob::new(id.clone()).into()).await.unwrap();
    assert!(matches!(outcome, StageOutcome::Skipped(_)));
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 1);

    let refilled = h.queue.drain().await;
    assert_eq!(refilled.len(), 1);
    assert_eq!(scene_index(&refilled[0].1), 2);
}

#[tokio::test]
async fn test_script_stage_reuses_persisted_script() {
    let h = Harness::new(2);
    let id = h.submit().await;
    let (_, msg) = h.queue.pop().await.unwrap();

    // A previous delivery wrote the script and died before the transition.
    let script = h.writer.write_script("x", &GenerationConfig::default()).await.unwrap();
    reel_storage::put_json(&*h.artifacts, &artifacts::script_key(&id), &script)
        .await
        .unwrap();

    assert_eq!(h.run(&msg).await.unwrap(), StageOutcome::Advanced);
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.job(&id).await.total_scenes, Some(2));
}

#[tokio::test]
async fn test_expired_job_is_swept_mid_flight() {
    let h = Harness::new(2);
    let (id, scenes) = h.fan_out().await;
    h.run(&scenes[0]).await.unwrap();
    assert_eq!(h.job(&id).await.status, JobStatus::GeneratingScenes);

    let removed = h.store.sweep_expired(Utc::now() + Duration::days(8)).await.unwrap();
    assert_eq!(removed, vec![id.clone()]);
    assert!(h.store.get(&id).await.unwrap_err().is_not_found());

    let outcome = h.run(&scenes[1]).await.unwrap();
    assert_eq!(outcome, StageOutcome::Skipped("missing"));
    assert_eq!(h.compose_enqueued().await, 0);
}

#[tokio::test]
async fn test_publish_redelivery_after_completion_does_not_upload_again() {
    let h = Harness::new(1);
    let id = h.submit().await;
    h.run_to_idle().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Complete);

    let outcome = h
        .run(&reel_queue::PublishJob::new(id.clone()).into())
        .await
        .unwrap();
    assert!(matches!(outcome, StageOutcome::Skipped(_)));
    assert_eq!(h.publisher.uploads.lock().unwrap().len(), 1);
}
