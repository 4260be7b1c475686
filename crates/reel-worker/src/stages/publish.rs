//! Publish stage: upload the composed video and finish the job.

use chrono::Utc;
use reel_genai::PublishMetadata;
use reel_models::{Job, JobStatus, Script};
use reel_queue::PublishJob;
use reel_storage::{artifacts, get_json, put_json, PublishReceipt, StorageError};
use reel_store::StatusDetails;

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::{retry_async, RetryConfig};
use crate::stages::{give_up, settle, StageOutcome};

pub async fn run(ctx: &PipelineContext, msg: &PublishJob) -> WorkerResult<StageOutcome> {
    let logger = JobLogger::new(&msg.job_id, "publish");
    let result = execute(ctx, msg, &logger).await;
    settle(ctx, &logger, &msg.job_id, result).await
}

async fn execute(ctx: &PipelineContext, msg: &PublishJob, logger: &JobLogger) -> WorkerResult<StageOutcome> {
    let job = ctx.store.get(&msg.job_id).await?;
    if job.status != JobStatus::Publishing {
        logger.log_skipped(&format!("job is {}", job.status));
        return Ok(StageOutcome::Skipped("job not publishing"));
    }

    let attempt = ctx.store.record_attempt(&job.job_id, JobStatus::Publishing).await?;
    if ctx.config.attempts_exhausted(attempt) {
        let reason = format!("publishing failed after {} attempts", ctx.config.max_retry_attempts);
        return give_up(ctx, logger, &job.job_id, reason).await;
    }
    logger.log_start(attempt);

    let receipt_key = artifacts::publish_receipt_key(&job.job_id);
    let receipt = match get_json::<PublishReceipt>(ctx.artifacts.as_ref(), &receipt_key).await? {
        Some(receipt) => {
            logger.log_progress("Already uploaded, reusing receipt");
            receipt
        }
        None => {
            let receipt = publish(ctx, &job).await?;
            retry_async(
                &RetryConfig::new("put_publish_receipt"),
                |e: &StorageError| e.is_retryable(),
                || put_json(ctx.artifacts.as_ref(), &receipt_key, &receipt),
            )
            .await?;
            receipt
        }
    };

    ctx.store
        .set_status_with(
            &job.job_id,
            JobStatus::Publishing,
            JobStatus::Complete,
            StatusDetails::published(&receipt.url),
        )
        .await?;

    logger.log_completion(&format!("published at {}", receipt.url));
    Ok(StageOutcome::Advanced)
}

async fn publish(ctx: &PipelineContext, job: &Job) -> WorkerResult<PublishReceipt> {
    let script_key = artifacts::script_key(&job.job_id);
    let script: Script = get_json(ctx.artifacts.as_ref(), &script_key)
        .await?
        .ok_or_else(|| WorkerError::missing_artifact(script_key))?;

    let asset_key = job
        .composed_asset_ref
        .clone()
        .unwrap_or_else(|| artifacts::composed_key(&job.job_id));

    let job_dir = ctx.job_work_dir(&job.job_id);
    tokio::fs::create_dir_all(&job_dir).await?;
    let work = tempfile::Builder::new().prefix("publish-").tempdir_in(&job_dir)?;
    let video = work.path().join("final.mp4");
    ctx.artifacts.download_file(&asset_key, &video).await?;

    let published = ctx
        .publisher
        .publish(&video, &PublishMetadata::from_script(&script))
        .await
        .map_err(WorkerError::publish)?;

    Ok(PublishReceipt {
        job_id: job.job_id.clone(),
        platform_id: published.platform_id,
        url: published.url,
        published_at: Utc::now(),
    })
}
