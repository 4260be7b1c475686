//! Scene stage: generate one scene's media, persist it, report to fan-in.

use chrono::Utc;
use reel_models::JobStatus;
use reel_queue::GenerateSceneJob;
use reel_storage::{artifacts, get_json, put_json, SceneManifest, StorageError};
use reel_store::StoreError;

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::{retry_async, RetryConfig};
use crate::stages::fan_in::{FanInCoordinator, FanInDecision};
use crate::stages::StageOutcome;

pub async fn run(ctx: &PipelineContext, msg: &GenerateSceneJob) -> WorkerResult<StageOutcome> {
    let logger = JobLogger::for_scene(&msg.job_id, msg.scene_index);
    let fan_in = FanInCoordinator::new(
        ctx.store.as_ref(),
        ctx.queue.as_ref(),
        ctx.config.scene_failure_policy,
    );

    match execute(ctx, msg, &logger, &fan_in).await {
        Err(WorkerError::Store(StoreError::NotFound(_))) => {
            logger.log_skipped("job no longer exists");
            Ok(StageOutcome::Skipped("missing"))
        }
        // A permanent error only takes this scene out; the failure policy
        // decides what happens to the job.
        Err(e) if !e.is_retryable() => {
            let reason = e.to_string();
            let decision = fan_in.scene_exhausted(&msg.job_id, msg.scene_index, &reason).await?;
            logger.log_failure(&format!("{} ({:?})", reason, decision));
            Ok(StageOutcome::GaveUp(reason))
        }
        other => other,
    }
}

async fn execute(
    ctx: &PipelineContext,
    msg: &GenerateSceneJob,
    logger: &JobLogger,
    fan_in: &FanInCoordinator<'_>,
) -> WorkerResult<StageOutcome> {
    let job = ctx.store.get(&msg.job_id).await?;
    let scene_index = msg.scene_index;

    if job.status != JobStatus::GeneratingScenes {
        if fan_in.reconfirm(&job, scene_index).await? {
            logger.log_progress("Re-emitted compose trigger");
        } else {
            logger.log_skipped(&format!("job is {}", job.status));
        }
        return Ok(StageOutcome::Skipped("job not generating scenes"));
    }
    if job.is_scene_completed(scene_index) || job.failed_scenes.contains(&scene_index) {
        logger.log_skipped("scene already accounted for");
        return Ok(StageOutcome::Skipped("scene already accounted"));
    }

    let attempt = ctx.store.record_scene_attempt(&job.job_id, scene_index).await?;
    if ctx.config.attempts_exhausted(attempt) {
        let reason = format!(
            "generation failed after {} attempts",
            ctx.config.max_retry_attempts
        );
        let decision = fan_in.scene_exhausted(&job.job_id, scene_index, &reason).await?;
        logger.log_failure(&format!("{} ({:?})", reason, decision));
        return Ok(StageOutcome::GaveUp(reason));
    }
    logger.log_start(attempt);

    let manifest_key = artifacts::scene_manifest_key(&job.job_id, scene_index);
    let existing: Option<SceneManifest> = get_json(ctx.artifacts.as_ref(), &manifest_key).await?;
    if existing.is_some() {
        logger.log_progress("Artifacts already written, skipping generation");
    } else {
        generate(ctx, msg, job.config.video_format).await?;
    }

    match fan_in.scene_completed(&job.job_id, scene_index).await? {
        FanInDecision::TriggeredCompose => logger.log_completion("last scene, composition triggered"),
        FanInDecision::AlreadyCounted => logger.log_skipped("scene counted by another delivery"),
        _ => logger.log_completion("scene counted"),
    }
    Ok(StageOutcome::Advanced)
}

/// Generate and persist the scene. The manifest is written last so its
/// presence means every other artifact is in place.
async fn generate(
    ctx: &PipelineContext,
    msg: &GenerateSceneJob,
    format: reel_models::VideoFormat,
) -> WorkerResult<()> {
    let job_id = &msg.job_id;
    let scene_index = msg.scene_index;

    let scene = ctx
        .scene_generator
        .generate_scene(&msg.generation_params, format)
        .await
        .map_err(WorkerError::generation)?;

    let retry = RetryConfig::new("put_scene_artifact");
    let retryable = |e: &StorageError| e.is_retryable();

    let video_key = artifacts::scene_video_key(job_id, scene_index);
    retry_async(&retry, retryable, || {
        ctx.artifacts.put_bytes(&video_key, scene.video.clone(), "video/mp4")
    })
    .await?;

    let audio_key = match &scene.audio {
        Some(audio) => {
            let key = artifacts::scene_audio_key(job_id, scene_index);
            retry_async(&retry, retryable, || {
                ctx.artifacts.put_bytes(&key, audio.clone(), "audio/mpeg")
            })
            .await?;
            Some(key)
        }
        None => None,
    };

    let manifest = SceneManifest {
        job_id: job_id.clone(),
        scene_index,
        video_key,
        audio_key,
        duration_secs: msg.generation_params.duration_secs,
        generated_at: Utc::now(),
    };
    let manifest_key = artifacts::scene_manifest_key(job_id, scene_index);
    retry_async(&retry, retryable, || {
        put_json(ctx.artifacts.as_ref(), &manifest_key, &manifest)
    })
    .await?;

    Ok(())
}
