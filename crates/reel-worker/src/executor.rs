//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use reel_queue::{JobQueue, QueueJob};

use crate::context::PipelineContext;
use crate::error::{WorkerError, WorkerResult};
use crate::stages::fan_in::FanInCoordinator;
use crate::stages::{run_stage, StageOutcome};

/// Consumes the stream and runs one stage per message.
pub struct JobExecutor {
    ctx: Arc<PipelineContext>,
    queue: Arc<JobQueue>,
    job_semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(ctx: PipelineContext, queue: Arc<JobQueue>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            ctx: Arc::new(ctx),
            queue,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.ctx.config.max_concurrent_jobs
        );

        self.ctx
            .config
            .check_visibility_timeout(self.queue.visibility_timeout())?;
        self.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight stages to complete...");
        let _ = tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_jobs()).await;

        info!("Job executor stopped");
        Ok(())
    }

    /// Periodically take over messages whose consumer died.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer_name = self.consumer_name.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let min_idle_ms = queue.visibility_timeout().as_millis() as u64;
        let claim_interval = ctx.config.claim_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match queue.claim_pending(&consumer_name, min_idle_ms, 5).await {
                            Ok(jobs) if !jobs.is_empty() => {
                                info!("Claimed {} pending messages", jobs.len());
                                for (message_id, job) in jobs {
                                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                        break;
                                    };
                                    let ctx = Arc::clone(&ctx);
                                    let queue = Arc::clone(&queue);
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute_job(ctx, queue, message_id, job).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim pending messages: {}", e),
                        }
                    }
                }
            }
        })
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} messages from queue", jobs.len());

        for (message_id, job) in jobs {
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&self.queue);
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::config_error("semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, queue, message_id, job).await;
            });
        }

        Ok(())
    }

    /// Run one message and settle it with the transport.
    ///
    /// Every `Ok` outcome is acked. Retryable errors leave the message pending so
    /// it is claimed again after the visibility timeout; the transport's own
    /// retry cap moves it to the DLQ.
    async fn execute_job(ctx: Arc<PipelineContext>, queue: Arc<JobQueue>, message_id: String, job: QueueJob) {
        let job_id = job.job_id().clone();
        let stage = job.stage();

        match run_stage(&ctx, &job).await {
            Ok(outcome) => {
                match &outcome {
                    StageOutcome::Advanced => info!(job_id = %job_id, stage, "Stage advanced job"),
                    StageOutcome::Skipped(reason) => {
                        debug!(job_id = %job_id, stage, reason = *reason, "Message dropped")
                    }
                    StageOutcome::GaveUp(reason) => {
                        warn!(job_id = %job_id, stage, reason = %reason, "Stage gave up")
                    }
                }
                if let Err(e) = queue.ack(&message_id).await {
                    error!(job_id = %job_id, stage, "Failed to ack message: {}", e);
                }
            }
            Err(e) if e.is_retryable() => {
                let retry_count = queue.increment_retry(&message_id).await.unwrap_or(u32::MAX);
                let max_retries = queue.max_retries();
                if retry_count >= max_retries {
                    warn!(job_id = %job_id, stage, "Exceeded {} deliveries, dead-lettering", max_retries);
                    Self::dead_letter(&ctx, &queue, &message_id, &job, &e).await;
                } else {
                    info!(
                        job_id = %job_id,
                        stage,
                        "Stage failed, will be redelivered (delivery {}/{}): {}",
                        retry_count, max_retries, e
                    );
                }
            }
            Err(e) => {
                error!(job_id = %job_id, stage, "Stage failed permanently: {}", e);
                Self::dead_letter(&ctx, &queue, &message_id, &job, &e).await;
            }
        }
    }

    /// Dead-letter a message and record the failure on the job so it does
    /// not sit in a non-terminal state forever.
    async fn dead_letter(ctx: &PipelineContext, queue: &JobQueue, message_id: &str, job: &QueueJob, error: &WorkerError) {
        let reason = format!("{} stage dead-lettered: {}", job.stage(), error);
        let recorded = match job {
            QueueJob::GenerateScene(scene) => FanInCoordinator::new(
                ctx.store.as_ref(),
                ctx.queue.as_ref(),
                ctx.config.scene_failure_policy,
            )
            .scene_exhausted(&scene.job_id, scene.scene_index, &reason)
            .await
            .map(|_| ()),
            _ => ctx.store.fail(job.job_id(), &reason).await.map(|_| ()).map_err(WorkerError::from),
        };
        if let Err(e) = recorded {
            warn!(job_id = %job.job_id(), "Failed to record dead-lettered message on job: {}", e);
        }

        if let Err(e) = queue.dlq(message_id, job, &error.to_string()).await {
            error!(job_id = %job.job_id(), "Failed to move message to DLQ: {}", e);
        }
    }

    async fn wait_for_jobs(&self) {
        while self.job_semaphore.available_permits() < self.ctx.config.max_concurrent_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
