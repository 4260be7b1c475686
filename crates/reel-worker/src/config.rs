//! Worker configuration.

use std::time::Duration;

use reel_models::SceneFailurePolicy;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum stage invocations running at once
    pub max_concurrent_jobs: usize,
    /// Upper bound on one stage invocation; exceeding it is a retryable failure
    pub stage_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: String,
    /// How often to scan for messages abandoned by crashed consumers
    pub claim_interval: Duration,
    /// Deliveries allowed per stage (and per scene) before giving up
    pub max_retry_attempts: u32,
    /// What a scene that exhausts its attempts does to its job
    pub scene_failure_policy: SceneFailurePolicy,
    /// Kill FFmpeg after this long
    pub ffmpeg_timeout_secs: u64,
    /// Port for the Prometheus scrape endpoint; disabled when `None`
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            stage_timeout: Duration::from_secs(900),
            shutdown_timeout: Duration::from_secs(60),
            work_dir: "/tmp/reelforge".to_string(),
            claim_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            scene_failure_policy: SceneFailurePolicy::FailJob,
            ffmpeg_timeout_secs: 600,
            metrics_port: Some(9100),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS").unwrap_or(defaults.max_concurrent_jobs),
            stage_timeout: Duration::from_secs(
                env_parse("STAGE_TIMEOUT_SECS").unwrap_or(defaults.stage_timeout.as_secs()),
            ),
            shutdown_timeout: Duration::from_secs(
                env_parse("WORKER_SHUTDOWN_TIMEOUT").unwrap_or(defaults.shutdown_timeout.as_secs()),
            ),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            claim_interval: Duration::from_secs(
                env_parse("WORKER_CLAIM_INTERVAL_SECS").unwrap_or(defaults.claim_interval.as_secs()),
            ),
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS").unwrap_or(defaults.max_retry_attempts),
            scene_failure_policy: std::env::var("SCENE_FAILURE_POLICY")
                .ok()
                .and_then(|v| SceneFailurePolicy::parse(&v))
                .unwrap_or(defaults.scene_failure_policy),
            ffmpeg_timeout_secs: env_parse("FFMPEG_TIMEOUT_SECS").unwrap_or(defaults.ffmpeg_timeout_secs),
            metrics_port: match std::env::var("METRICS_ENABLED").map(|v| v.to_lowercase()) {
                Ok(v) if v == "false" || v == "0" => None,
                _ => Some(env_parse("WORKER_METRICS_PORT").unwrap_or(9100)),
            },
        }
    }

    /// Reject a queue visibility timeout that a running stage can outlive.
    ///
    /// Pending messages are claimed once idle for `visibility_timeout`, so a
    /// stage still inside `stage_timeout` would otherwise run twice.
    pub fn check_visibility_timeout(&self, visibility_timeout: Duration) -> WorkerResult<()> {
        if visibility_timeout <= self.stage_timeout {
            return Err(WorkerError::config_error(format!(
                "queue visibility timeout ({}s) must exceed the stage timeout ({}s)",
                visibility_timeout.as_secs(),
                self.stage_timeout.as_secs()
            )));
        }
        Ok(())
    }

    /// True once `attempt` is past the allowed number of deliveries.
    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retry_attempts
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_bound() {
        let config = WorkerConfig::default();
        assert!(!config.attempts_exhausted(1));
        assert!(!config.attempts_exhausted(3));
        assert!(config.attempts_exhausted(4));
    }

    #[test]
    fn test_visibility_timeout_must_outlast_stage() {
        let config = WorkerConfig::default();
        assert!(config
            .check_visibility_timeout(reel_queue::QueueConfig::default().visibility_timeout)
            .is_ok());
        assert!(config.check_visibility_timeout(Duration::from_secs(600)).is_err());
        assert!(config.check_visibility_timeout(config.stage_timeout).is_err());
    }
}
