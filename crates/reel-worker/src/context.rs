//! Shared dependencies for stage invocations.

use std::path::PathBuf;
use std::sync::Arc;

use reel_genai::{
    build_client, ChatScriptWriter, FalSceneGenerator, GenaiConfig, Publisher, SceneGenerator,
    ScriptWriter, YoutubePublisher,
};
use reel_media::{Composer, FfmpegComposer, FfmpegRunner};
use reel_queue::JobSink;
use reel_storage::{ArtifactStore, S3ArtifactStore};
use reel_store::{JobStore, RedisJobStore};
use tracing::warn;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// Everything a stage needs. Backends sit behind traits so tests can
/// substitute in-process fakes.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: WorkerConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobSink>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub script_writer: Arc<dyn ScriptWriter>,
    pub scene_generator: Arc<dyn SceneGenerator>,
    pub composer: Arc<dyn Composer>,
    pub publisher: Arc<dyn Publisher>,
}

impl PipelineContext {
    /// Wire production backends from the environment.
    pub async fn from_env(config: WorkerConfig, queue: Arc<dyn JobSink>) -> WorkerResult<Self> {
        let store = RedisJobStore::from_env()?;
        let artifacts = S3ArtifactStore::from_env()?;
        if let Err(e) = artifacts.check_connectivity().await {
            warn!("Object storage is not reachable yet: {}", e);
        }
        let genai = GenaiConfig::from_env().map_err(|e| WorkerError::config_error(e.to_string()))?;
        let client = build_client(genai.request_timeout).map_err(|e| WorkerError::config_error(e.to_string()))?;

        let composer =
            FfmpegComposer::new(FfmpegRunner::new().with_timeout(config.ffmpeg_timeout_secs));

        Ok(Self {
            store: Arc::new(store),
            queue,
            artifacts: Arc::new(artifacts),
            script_writer: Arc::new(ChatScriptWriter::new(
                client.clone(),
                genai.script.clone(),
                genai.max_http_retries,
            )),
            scene_generator: Arc::new(FalSceneGenerator::new(
                client.clone(),
                genai.fal.clone(),
                genai.max_http_retries,
            )),
            composer: Arc::new(composer),
            publisher: Arc::new(YoutubePublisher::new(client, genai.youtube, genai.max_http_retries)),
            config,
        })
    }

    /// Scratch directory for one job's local files.
    pub fn job_work_dir(&self, job_id: &reel_models::JobId) -> PathBuf {
        PathBuf::from(&self.config.work_dir).join(job_id.as_str())
    }
}
