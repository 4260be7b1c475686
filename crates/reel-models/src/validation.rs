//! Submission request validation.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

use crate::{GenerationConfig, Quality, VideoFormat};

/// Rejected submission input. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Topic must be between {min} and {max} characters (got {actual})")]
    InvalidTopic { min: usize, max: usize, actual: usize },

    #[error("Topic contains inappropriate content")]
    InappropriateContent,

    #[error("Duration must be between {min} and {max} seconds")]
    InvalidDuration { min: u32, max: u32 },

    #[error("Quality must be one of: standard, high, premium")]
    InvalidQuality,

    #[error("Invalid scene bounds: min {min}, max {max}")]
    InvalidSceneBounds { min: u32, max: u32 },
}

/// Job submission as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default)]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub video_format: Option<VideoFormat>,
    #[serde(default)]
    pub style: Option<String>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

/// Bounds enforced on every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPolicy {
    pub topic_min_chars: usize,
    pub topic_max_chars: usize,
    pub min_duration_secs: u32,
    pub max_duration_secs: u32,
    pub default_duration_secs: u32,
    pub min_scenes: u32,
    pub max_scenes: u32,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            topic_min_chars: 10,
            topic_max_chars: 2000,
            min_duration_secs: 5,
            max_duration_secs: 120,
            default_duration_secs: 30,
            min_scenes: 1,
            max_scenes: 12,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SubmissionPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            topic_min_chars: env_or("TOPIC_MIN_CHARS", defaults.topic_min_chars),
            topic_max_chars: env_or("TOPIC_MAX_CHARS", defaults.topic_max_chars),
            min_duration_secs: env_or("MIN_DURATION_SECS", defaults.min_duration_secs),
            max_duration_secs: env_or("MAX_DURATION_SECS", defaults.max_duration_secs),
            default_duration_secs: env_or("DEFAULT_DURATION_SECS", defaults.default_duration_secs),
            min_scenes: env_or("MIN_SCENES", defaults.min_scenes),
            max_scenes: env_or("MAX_SCENES", defaults.max_scenes),
        }
    }
}

/// Basic content filter applied to topics.
static BLOCKED_TERMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(violence|gore|explicit|nsfw|adult)\b").unwrap());

impl SubmissionPolicy {
    /// Validate a request and produce the trimmed topic and the job config.
    pub fn validate(
        &self,
        request: &GenerationRequest,
    ) -> Result<(String, GenerationConfig), ValidationError> {
        if self.min_scenes == 0 || self.min_scenes > self.max_scenes {
            return Err(ValidationError::InvalidSceneBounds {
                min: self.min_scenes,
                max: self.max_scenes,
            });
        }

        let topic = request.topic.trim();
        let chars = topic.chars().count();
        if chars < self.topic_min_chars || chars > self.topic_max_chars {
            return Err(ValidationError::InvalidTopic {
                min: self.topic_min_chars,
                max: self.topic_max_chars,
                actual: chars,
            });
        }
        if BLOCKED_TERMS.is_match(topic) {
            return Err(ValidationError::InappropriateContent);
        }

        let duration_secs = request.duration_secs.unwrap_or(self.default_duration_secs);
        if duration_secs < self.min_duration_secs || duration_secs > self.max_duration_secs {
            return Err(ValidationError::InvalidDuration {
                min: self.min_duration_secs,
                max: self.max_duration_secs,
            });
        }

        let quality = match request.quality.as_deref() {
            None => Quality::default(),
            Some(q) => Quality::parse(q).ok_or(ValidationError::InvalidQuality)?,
        };

        let config = GenerationConfig {
            duration_secs,
            quality,
            video_format: request.video_format.unwrap_or_default(),
            style: request
                .style
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            min_scenes: self.min_scenes,
            max_scenes: self.max_scenes,
        };

        Ok((topic.to_string(), config))
    }
}
