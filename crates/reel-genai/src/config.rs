//! Backend configuration.

use std::time::Duration;

use crate::error::{GenaiError, GenaiResult};

/// OpenAI-compatible chat completion endpoint used to write scripts.
#[derive(Debug, Clone)]
pub struct ScriptWriterConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// fal.run endpoints for video and narration.
#[derive(Debug, Clone)]
pub struct FalConfig {
    pub base_url: String,
    pub api_key: String,
    pub video_model: String,
    pub tts_model: String,
}

/// YouTube Data API credentials.
#[derive(Debug, Clone)]
pub struct YoutubeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_uri: String,
    pub api_base: String,
    pub privacy_status: String,
}

/// Configuration for all generation backends.
#[derive(Debug, Clone)]
pub struct GenaiConfig {
    pub script: ScriptWriterConfig,
    pub fal: FalConfig,
    pub youtube: YoutubeConfig,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Retries for 5xx/429 responses
    pub max_http_retries: u32,
}

impl GenaiConfig {
    /// Load from environment variables. API keys are required.
    pub fn from_env() -> GenaiResult<Self> {
        Ok(Self {
            script: ScriptWriterConfig {
                base_url: env_or("SCRIPT_API_BASE_URL", "https://api.deepseek.com"),
                api_key: required("SCRIPT_API_KEY")?,
                model: env_or("SCRIPT_MODEL", "deepseek-chat"),
            },
            fal: FalConfig {
                base_url: env_or("FAL_BASE_URL", "https://fal.run"),
                api_key: required("FAL_KEY")?,
                video_model: env_or(
                    "FAL_VIDEO_MODEL",
                    "fal-ai/bytedance/seedance/v1/lite/text-to-video",
                ),
                tts_model: env_or("FAL_TTS_MODEL", "fal-ai/kokoro/american-english"),
            },
            youtube: YoutubeConfig {
                client_id: required("YOUTUBE_CLIENT_ID")?,
                client_secret: required("YOUTUBE_CLIENT_SECRET")?,
                refresh_token: required("YOUTUBE_REFRESH_TOKEN")?,
                token_uri: env_or("YOUTUBE_TOKEN_URI", "https://oauth2.googleapis.com/token"),
                api_base: env_or("YOUTUBE_API_BASE", "https://www.googleapis.com"),
                privacy_status: env_or("YOUTUBE_PRIVACY_STATUS", "public"),
            },
            request_timeout: Duration::from_secs(
                std::env::var("GENAI_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_http_retries: std::env::var("GENAI_HTTP_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required(key: &str) -> GenaiResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| GenaiError::config(format!("{key} not set")))
}
