//! Script stage: topic to script, then one fan-out message per scene.

use reel_models::{Job, JobStatus, Script};
use reel_queue::{GenerateSceneJob, WriteScriptJob};
use reel_storage::{artifacts, get_json, put_json};
use reel_store::StoreError;

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::{retry_async, RetryConfig};
use crate::stages::{enqueue_once, give_up, settle, StageOutcome};

pub async fn run(ctx: &PipelineContext, msg: &WriteScriptJob) -> WorkerResult<StageOutcome> {
    let logger = JobLogger::new(&msg.job_id, "script");
    let result = execute(ctx, msg, &logger).await;
    settle(ctx, &logger, &msg.job_id, result).await
}

async fn execute(ctx: &PipelineContext, msg: &WriteScriptJob, logger: &JobLogger) -> WorkerResult<StageOutcome> {
    let job = ctx.store.get(&msg.job_id).await?;

    match job.status {
        JobStatus::PendingScript => {}
        JobStatus::GeneratingScenes => {
            // The previous delivery may have died between setting the total
            // and enqueueing every scene.
            let script = load_script(ctx, &job).await?.ok_or_else(|| {
                WorkerError::missing_artifact(artifacts::script_key(&job.job_id))
            })?;
            let enqueued = fan_out(ctx, &job, &script).await?;
            logger.log_progress(&format!("Re-emitted {} missing scene messages", enqueued));
            return Ok(StageOutcome::Skipped("scenes already fanned out"));
        }
        _ => {
            logger.log_skipped("job is past the script stage");
            return Ok(StageOutcome::Skipped("past script stage"));
        }
    }

    let attempt = ctx.store.record_attempt(&job.job_id, JobStatus::PendingScript).await?;
    if ctx.config.attempts_exhausted(attempt) {
        let reason = format!(
            "script generation failed after {} attempts",
            ctx.config.max_retry_attempts
        );
        return give_up(ctx, logger, &job.job_id, reason).await;
    }
    logger.log_start(attempt);

    let script = match load_script(ctx, &job).await? {
        Some(script) => {
            logger.log_progress("Reusing persisted script");
            script
        }
        None => {
            let script = write_script(ctx, &job).await?;
            let key = artifacts::script_key(&job.job_id);
            retry_async(
                &RetryConfig::new("put_script"),
                |e: &reel_storage::StorageError| e.is_retryable(),
                || put_json(ctx.artifacts.as_ref(), &key, &script),
            )
            .await?;
            script
        }
    };

    let job = match ctx
        .store
        .begin_scene_generation(&job.job_id, script.scene_count())
        .await
    {
        Ok(job) => job,
        // A concurrent delivery won the race; its fan-out is deduplicated
        // against ours.
        Err(StoreError::StaleState { actual, .. }) if actual == JobStatus::GeneratingScenes => {
            ctx.store.get(&job.job_id).await?
        }
        Err(e) => return Err(e.into()),
    };

    let enqueued = fan_out(ctx, &job, &script).await?;
    logger.log_completion(&format!("\"{}\" with {} scenes", script.title, enqueued));
    Ok(StageOutcome::Advanced)
}

/// Ask the backend for a script and fit it to the job's scene bounds.
async fn write_script(ctx: &PipelineContext, job: &Job) -> WorkerResult<Script> {
    let mut script = ctx
        .script_writer
        .write_script(&job.topic, &job.config)
        .await
        .map_err(WorkerError::generation)?;

    if script.scene_count() > job.config.max_scenes {
        script.truncate_scenes(job.config.max_scenes);
    }
    if script.scene_count() < job.config.min_scenes.max(1) {
        return Err(WorkerError::invalid_script(format!(
            "script has {} scenes, at least {} required",
            script.scene_count(),
            job.config.min_scenes.max(1)
        )));
    }
    Ok(script)
}

async fn load_script(ctx: &PipelineContext, job: &Job) -> WorkerResult<Option<Script>> {
    Ok(get_json(ctx.artifacts.as_ref(), &artifacts::script_key(&job.job_id)).await?)
}

/// Enqueue one message per scene. Returns how many were new.
async fn fan_out(ctx: &PipelineContext, job: &Job, script: &Script) -> WorkerResult<usize> {
    let mut enqueued = 0;
    for (index, params) in script
        .scene_params(job.config.style.as_deref())
        .into_iter()
        .enumerate()
    {
        let msg = GenerateSceneJob::new(job.job_id.clone(), index as u32, params);
        if enqueue_once(ctx.queue.as_ref(), msg.into()).await? {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}
