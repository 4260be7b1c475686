//! Compose stage: join scene media in scene order into the final video.

use reel_media::SceneMedia;
use reel_models::{Job, JobId, JobStatus};
use reel_queue::{ComposeJob, PublishJob};
use reel_storage::{artifacts, get_json, SceneManifest, StorageError};
use reel_store::{StatusDetails, StoreError};

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::{retry_async, RetryConfig};
use crate::stages::{enqueue_once, give_up, settle, StageOutcome};

pub async fn run(ctx: &PipelineContext, msg: &ComposeJob) -> WorkerResult<StageOutcome> {
    let logger = JobLogger::new(&msg.job_id, "compose");
    let result = execute(ctx, msg, &logger).await;
    settle(ctx, &logger, &msg.job_id, result).await
}

async fn execute(ctx: &PipelineContext, msg: &ComposeJob, logger: &JobLogger) -> WorkerResult<StageOutcome> {
    let job = ctx.store.get(&msg.job_id).await?;
    match job.status {
        JobStatus::Composing => {}
        JobStatus::Publishing => {
            // An earlier delivery advanced the job; its publish enqueue may not have landed.
            if emit_publish(ctx, &job.job_id).await? {
                logger.log_progress("Re-emitted publish message");
            }
            return Ok(StageOutcome::Skipped("job already publishing"));
        }
        status => {
            logger.log_skipped(&format!("job is {}", status));
            return Ok(StageOutcome::Skipped("job not composing"));
        }
    }

    let attempt = ctx.store.record_attempt(&job.job_id, JobStatus::Composing).await?;
    if ctx.config.attempts_exhausted(attempt) {
        let reason = format!("composition failed after {} attempts", ctx.config.max_retry_attempts);
        return give_up(ctx, logger, &job.job_id, reason).await;
    }
    logger.log_start(attempt);

    let composed_key = artifacts::composed_key(&job.job_id);
    if ctx.artifacts.exists(&composed_key).await? {
        logger.log_progress("Composed asset already in storage, reusing it");
    } else {
        compose(ctx, &job, &composed_key).await?;
    }

    // A stale PUBLISHING status is a duplicate compose, or a retried write whose
    // first reply was lost. Either way publish still has to be enqueued.
    match ctx
        .store
        .set_status_with(
            &job.job_id,
            JobStatus::Composing,
            JobStatus::Publishing,
            StatusDetails::composed(&composed_key),
        )
        .await
    {
        Ok(_) => {}
        Err(StoreError::StaleState {
            actual: JobStatus::Publishing,
            ..
        }) => {
            emit_publish(ctx, &job.job_id).await?;
            logger.log_skipped("job already advanced to publishing");
            return Ok(StageOutcome::Skipped("job already publishing"));
        }
        Err(e) => return Err(e.into()),
    }

    emit_publish(ctx, &job.job_id).await?;
    logger.log_completion(&format!("composed {} scenes", job.composable_scenes().len()));
    Ok(StageOutcome::Advanced)
}

async fn emit_publish(ctx: &PipelineContext, job_id: &JobId) -> WorkerResult<bool> {
    enqueue_once(ctx.queue.as_ref(), PublishJob::new(job_id.clone()).into()).await
}

async fn compose(ctx: &PipelineContext, job: &Job, composed_key: &str) -> WorkerResult<()> {
    let scene_indices = job.composable_scenes();
    if scene_indices.is_empty() {
        return Err(WorkerError::invalid_script("no scenes left to compose"));
    }

    let job_dir = ctx.job_work_dir(&job.job_id);
    tokio::fs::create_dir_all(&job_dir).await?;
    let work = tempfile::Builder::new().prefix("compose-").tempdir_in(&job_dir)?;

    // Scene order, not completion order.
    let mut media = Vec::with_capacity(scene_indices.len());
    for index in scene_indices {
        let manifest_key = artifacts::scene_manifest_key(&job.job_id, index);
        let manifest: SceneManifest = get_json(ctx.artifacts.as_ref(), &manifest_key)
            .await?
            .ok_or_else(|| WorkerError::missing_artifact(manifest_key))?;

        let scene_dir = work.path().join(format!("scene_{:04}", index));
        let video = scene_dir.join("video.mp4");
        ctx.artifacts.download_file(&manifest.video_key, &video).await?;

        let audio = match &manifest.audio_key {
            Some(key) => {
                let path = scene_dir.join("audio.mp3");
                ctx.artifacts.download_file(key, &path).await?;
                Some(path)
            }
            None => None,
        };
        media.push(SceneMedia::new(video, audio));
    }

    let output = work.path().join("final.mp4");
    ctx.composer
        .compose(&media, job.config.video_format, &output)
        .await?;

    retry_async(
        &RetryConfig::new("put_composed"),
        |e: &StorageError| e.is_retryable(),
        || ctx.artifacts.put_file(&output, composed_key, "video/mp4"),
    )
    .await?;
    Ok(())
}
