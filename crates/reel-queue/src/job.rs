//! Job types for the queue.

use serde::{Deserialize, Serialize};
use reel_models::{GenerationParams, JobId};

/// Write the script for a submitted job and fan out its scenes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteScriptJob {
    pub job_id: JobId,
}

impl WriteScriptJob {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("script:{}", self.job_id)
    }
}

/// Fan-out message: generate the media for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateSceneJob {
    pub job_id: JobId,
    /// 0-based; defines composition order
    pub scene_index: u32,
    pub generation_params: GenerationParams,
}

impl GenerateSceneJob {
    pub fn new(job_id: JobId, scene_index: u32, generation_params: GenerationParams) -> Self {
        Self {
            job_id,
            scene_index,
            generation_params,
        }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("scene:{}:{}", self.job_id, self.scene_index)
    }
}

/// Compose all scene artifacts of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeJob {
    pub job_id: JobId,
}

impl ComposeJob {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("compose:{}", self.job_id)
    }
}

/// Upload the composed asset of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishJob {
    pub job_id: JobId,
}

impl PublishJob {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("publish:{}", self.job_id)
    }
}

/// Any message carried by the pipeline stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    WriteScript(WriteScriptJob),
    GenerateScene(GenerateSceneJob),
    Compose(ComposeJob),
    Publish(PublishJob),
}

impl QueueJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueJob::WriteScript(j) => &j.job_id,
            QueueJob::GenerateScene(j) => &j.job_id,
            QueueJob::Compose(j) => &j.job_id,
            QueueJob::Publish(j) => &j.job_id,
        }
    }

    /// Stage name for logs and metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            QueueJob::WriteScript(_) => "script",
            QueueJob::GenerateScene(_) => "scene",
            QueueJob::Compose(_) => "compose",
            QueueJob::Publish(_) => "publish",
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            QueueJob::WriteScript(j) => j.idempotency_key(),
            QueueJob::GenerateScene(j) => j.idempotency_key(),
            QueueJob::Compose(j) => j.idempotency_key(),
            QueueJob::Publish(j) => j.idempotency_key(),
        }
    }
}

impl From<WriteScriptJob> for QueueJob {
    fn from(job: WriteScriptJob) -> Self {
        QueueJob::WriteScript(job)
    }
}

impl From<GenerateSceneJob> for QueueJob {
    fn from(job: GenerateSceneJob) -> Self {
        QueueJob::GenerateScene(job)
    }
}

impl From<ComposeJob> for QueueJob {
    fn from(job: ComposeJob) -> Self {
        QueueJob::Compose(job)
    }
}

impl From<PublishJob> for QueueJob {
    fn from(job: PublishJob) -> Self {
        QueueJob::Publish(job)
    }
}
