//! Job record and identifiers.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::{GenerationConfig, JobStatus};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens when a scene exhausts its delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SceneFailurePolicy {
    /// The whole job moves to `FAILED`.
    #[default]
    FailJob,
    /// The scene counts as accounted for and composition skips it.
    ComposeWithGap,
}

impl SceneFailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fail_job" | "fail" => Some(SceneFailurePolicy::FailJob),
            "compose_with_gap" | "gap" => Some(SceneFailurePolicy::ComposeWithGap),
            _ => None,
        }
    }
}

/// Time-boxed retention of job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a record lives after creation
    pub retention: Duration,
    /// Floor applied to `retention`
    pub min_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::days(7),
            min_retention: Duration::hours(1),
        }
    }
}

impl RetentionPolicy {
    pub fn new(retention: Duration, min_retention: Duration) -> Self {
        Self {
            retention,
            min_retention,
        }
    }

    /// Create policy from `JOB_RETENTION_DAYS` and `MIN_RETENTION_HOURS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let days = std::env::var("JOB_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Duration::days)
            .unwrap_or(defaults.retention);
        let hours = std::env::var("MIN_RETENTION_HOURS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Duration::hours)
            .unwrap_or(defaults.min_retention);
        Self::new(days, hours)
    }

    /// Expiry for a record created at `created_at`; never below the floor.
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.retention.max(self.min_retention)
    }
}

/// A generation job as held by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub job_id: JobId,
    pub owner_id: String,
    pub topic: String,
    pub config: GenerationConfig,
    pub status: JobStatus,
    /// Set once by the script stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_scenes: Option<u32>,
    pub completed_scenes: u32,
    /// Scene indices that have contributed to `completed_scenes`
    #[serde(default)]
    pub completed_indices: BTreeSet<u32>,
    /// Scene indices that exhausted their attempts
    #[serde(default)]
    pub failed_scenes: BTreeSet<u32>,
    /// Delivery attempts per scene index
    #[serde(default)]
    pub scene_attempts: BTreeMap<u32, u32>,
    /// Attempts of the current stage; reset on every status change
    pub attempt_count: u32,
    /// Scene whose completion tripped the fan-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_in_scene: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composed_asset_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `PENDING_SCRIPT`.
    pub fn new(
        owner_id: impl Into<String>,
        topic: impl Into<String>,
        config: GenerationConfig,
        retention: &RetentionPolicy,
    ) -> Self {
        Self::new_at(owner_id, topic, config, retention, Utc::now())
    }

    pub fn new_at(
        owner_id: impl Into<String>,
        topic: impl Into<String>,
        config: GenerationConfig,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            owner_id: owner_id.into(),
            topic: topic.into(),
            config,
            status: JobStatus::PendingScript,
            total_scenes: None,
            completed_scenes: 0,
            completed_indices: BTreeSet::new(),
            failed_scenes: BTreeSet::new(),
            scene_attempts: BTreeMap::new(),
            attempt_count: 0,
            fan_in_scene: None,
            composed_asset_ref: None,
            published_url: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            expires_at: retention.expires_at(now),
        }
    }

    pub fn with_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_scene_completed(&self, scene_index: u32) -> bool {
        self.completed_indices.contains(&scene_index)
    }

    /// Scenes that no longer need work: completed plus failed ones.
    pub fn accounted_scenes(&self) -> u32 {
        self.completed_scenes + self.failed_scenes.difference(&self.completed_indices).count() as u32
    }

    /// Scene indices to compose, in order, skipping failed scenes.
    pub fn composable_scenes(&self) -> Vec<u32> {
        let total = self.total_scenes.unwrap_or(0);
        (0..total)
            .filter(|i| !self.failed_scenes.contains(i))
            .collect()
    }

    /// Completion percentage of the scene stage (0-100).
    pub fn progress_percent(&self) -> u8 {
        match self.total_scenes {
            Some(total) if total > 0 => {
                ((self.accounted_scenes().min(total) as u64 * 100) / total as u64) as u8
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expiry_respects_floor() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = RetentionPolicy::new(Duration::minutes(5), Duration::hours(1));
        assert_eq!(policy.expires_at(created), created + Duration::hours(1));

        let policy = RetentionPolicy::default();
        assert_eq!(policy.expires_at(created), created + Duration::days(7));
    }

    #[test]
    fn test_new_job_starts_pending() {
        let job = Job::new("owner-1", "topic", GenerationConfig::default(), &RetentionPolicy::default());
        assert_eq!(job.status, JobStatus::PendingScript);
        assert_eq!(job.total_scenes, None);
        assert_eq!(job.completed_scenes, 0);
        assert!(job.expires_at > job.created_at);
    }

    #[test]
    fn test_accounting_with_failed_scenes() {
        let mut job = Job::new("o", "t", GenerationConfig::default(), &RetentionPolicy::default());
        job.total_scenes = Some(4);
        job.completed_indices.extend([0, 2]);
        job.completed_scenes = 2;
        job.failed_scenes.insert(1);
        assert_eq!(job.accounted_scenes(), 3);
        assert_eq!(job.composable_scenes(), vec![0, 2, 3]);
        assert_eq!(job.progress_percent(), 75);
    }

    #[test]
    fn test_record_serialization() {
        let mut job = Job::new("o", "t", GenerationConfig::default(), &RetentionPolicy::default());
        job.failed_scenes.insert(3);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "PENDING_SCRIPT");
        assert_eq!(value["failed_scenes"], serde_json::json!([3]));
        assert!(value.get("total_scenes").is_none());
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(SceneFailurePolicy::parse("compose_with_gap"), Some(SceneFailurePolicy::ComposeWithGap));
        assert_eq!(SceneFailurePolicy::parse("FAIL_JOB"), Some(SceneFailurePolicy::FailJob));
        assert_eq!(SceneFailurePolicy::parse("retry"), None);
    }
}
