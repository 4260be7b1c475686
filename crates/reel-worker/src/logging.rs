//! Structured stage logging.

use tracing::{debug, info, warn, Span};

use reel_models::JobId;

/// Logs stage lifecycle events with the job, stage and scene attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    stage: &'static str,
    scene_index: Option<u32>,
}

impl JobLogger {
    pub fn new(job_id: &JobId, stage: &'static str) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage,
            scene_index: None,
        }
    }

    pub fn for_scene(job_id: &JobId, scene_index: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage: "scene",
            scene_index: Some(scene_index),
        }
    }

    pub fn log_start(&self, attempt: u32) {
        info!(
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index,
            attempt,
            "Stage started"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index,
            "{}", message
        );
    }

    /// Duplicate or late deliveries. Never an error.
    pub fn log_skipped(&self, reason: &str) {
        debug!(
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index,
            "Duplicate delivery dropped: {}", reason
        );
    }

    pub fn log_failure(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index,
            "Stage gave up: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index,
            "Stage completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Span covering one stage invocation.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "stage",
            job_id = %self.job_id,
            stage = self.stage,
            scene_index = self.scene_index
        )
    }
}
