//! Pipeline stages.
//!
//! Every stage is safe to run any number of times for the same message:
//! each side effect is guarded by durable state (the job record or an
//! artifact already in object storage) before it is re-executed.

pub mod compose;
pub mod fan_in;
pub mod publish;
pub mod scene;
pub mod script;

use metrics::counter;
use reel_models::JobId;
use reel_queue::{JobSink, QueueJob};
use reel_store::StoreError;
use tracing::{debug, Instrument};

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// How a stage invocation ended, when it did not return an error.
///
/// All three are final for the message: the executor acks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage did its work and advanced the job.
    Advanced,
    /// Duplicate, stale or late delivery; nothing to do.
    Skipped(&'static str),
    /// Attempts ran out or the error was permanent; the job or scene is
    /// recorded as failed.
    GaveUp(String),
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Advanced => "advanced",
            StageOutcome::Skipped(_) => "skipped",
            StageOutcome::GaveUp(_) => "gave_up",
        }
    }
}

/// Run the stage for `job`, bounded by the configured stage timeout.
pub async fn run_stage(ctx: &PipelineContext, job: &QueueJob) -> WorkerResult<StageOutcome> {
    let stage = job.stage();
    let logger = match job {
        QueueJob::GenerateScene(j) => JobLogger::for_scene(&j.job_id, j.scene_index),
        _ => JobLogger::new(job.job_id(), stage),
    };

    let work = async {
        match job {
            QueueJob::WriteScript(j) => script::run(ctx, j).await,
            QueueJob::GenerateScene(j) => scene::run(ctx, j).await,
            QueueJob::Compose(j) => compose::run(ctx, j).await,
            QueueJob::Publish(j) => publish::run(ctx, j).await,
        }
    };

    let result = match tokio::time::timeout(ctx.config.stage_timeout, work.instrument(logger.create_span())).await {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Timeout {
            stage,
            secs: ctx.config.stage_timeout.as_secs(),
        }),
    };

    let outcome = match &result {
        Ok(outcome) => outcome.label(),
        Err(e) if e.is_retryable() => "retry",
        Err(_) => "error",
    };
    counter!("worker_stage_outcomes_total", "stage" => stage, "outcome" => outcome).increment(1);

    result
}

/// Enqueue a follow-up message. Returns false when an identical message
/// was already enqueued.
pub(crate) async fn enqueue_once(queue: &dyn JobSink, job: QueueJob) -> WorkerResult<bool> {
    let key = job.idempotency_key();
    match queue.enqueue(job).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_duplicate() => {
            debug!(idempotency_key = %key, "Message already enqueued");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark the job failed after a permanent error or exhausted attempts.
pub(crate) async fn give_up(
    ctx: &PipelineContext,
    logger: &JobLogger,
    job_id: &JobId,
    reason: String,
) -> WorkerResult<StageOutcome> {
    if ctx.store.fail(job_id, &reason).await? {
        counter!("worker_jobs_failed_total", "stage" => logger.stage()).increment(1);
    }
    logger.log_failure(&reason);
    Ok(StageOutcome::GaveUp(reason))
}

/// Route a stage error: permanent errors fail the job, retryable ones go
/// back to the queue for redelivery.
pub(crate) async fn settle(
    ctx: &PipelineContext,
    logger: &JobLogger,
    job_id: &JobId,
    result: WorkerResult<StageOutcome>,
) -> WorkerResult<StageOutcome> {
    match result {
        Err(WorkerError::Store(StoreError::StaleState { .. })) => {
            logger.log_skipped("job moved on while the stage was running");
            Ok(StageOutcome::Skipped("stale"))
        }
        Err(WorkerError::Store(StoreError::NotFound(_))) => {
            logger.log_skipped("job no longer exists");
            Ok(StageOutcome::Skipped("missing"))
        }
        Err(e) if !e.is_retryable() => give_up(ctx, logger, job_id, e.to_string()).await,
        other => other,
    }
}
