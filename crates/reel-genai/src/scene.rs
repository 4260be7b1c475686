//! Scene generation through fal.run text-to-video and text-to-speech models.

use async_trait::async_trait;
use reel_models::{GenerationParams, VideoFormat};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::FalConfig;
use crate::error::{GenaiError, GenaiResult};
use crate::http::{download, send_with_retry};

/// Media produced for one scene.
#[derive(Debug, Clone)]
pub struct GeneratedScene {
    pub video: Vec<u8>,
    /// Narration track, present when the scene has narration text
    pub audio: Option<Vec<u8>>,
}

/// Renders one scene from its generation parameters.
#[async_trait]
pub trait SceneGenerator: Send + Sync {
    async fn generate_scene(&self, params: &GenerationParams, format: VideoFormat) -> GenaiResult<GeneratedScene>;
}

#[derive(Debug, Deserialize)]
struct FileRef {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoResult {
    video: FileRef,
}

#[derive(Debug, Deserialize)]
struct AudioResult {
    audio: FileRef,
}

/// [`SceneGenerator`] backed by fal.run.
pub struct FalSceneGenerator {
    client: Client,
    config: FalConfig,
    max_retries: u32,
}

impl FalSceneGenerator {
    pub fn new(client: Client, config: FalConfig, max_retries: u32) -> Self {
        Self {
            client,
            config,
            max_retries,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            model.trim_start_matches('/')
        )
    }

    async fn run_model<T: serde::de::DeserializeOwned>(&self, backend: &'static str, model: &str, body: &Value) -> GenaiResult<T> {
        let url = self.endpoint(model);
        let response = send_with_retry(backend, self.max_retries, || {
            self.client
                .post(&url)
                .header("Authorization", format!("Key {}", self.config.api_key))
                .json(body)
        })
        .await?;

        response
            .json()
            .await
            .map_err(|e| GenaiError::invalid_response(format!("Failed to parse {backend} response: {e}")))
    }
}

/// Request body for the video model. Backend-specific keys the script
/// attached in `extra` are passed through but never override the core ones.
pub fn video_request(params: &GenerationParams, format: VideoFormat) -> Value {
    let prompt = match &params.style {
        Some(style) => format!("{}. Style: {}", params.prompt, style),
        None => params.prompt.clone(),
    };
    let aspect_ratio = match format {
        VideoFormat::Regular => "16:9",
        VideoFormat::Short => "9:16",
    };

    let mut body: Map<String, Value> = params.extra.clone();
    body.insert("prompt".to_string(), json!(prompt));
    body.insert("duration".to_string(), json!(params.duration_secs.to_string()));
    body.insert("aspect_ratio".to_string(), json!(aspect_ratio));
    Value::Object(body)
}

#[async_trait]
impl SceneGenerator for FalSceneGenerator {
    async fn generate_scene(&self, params: &GenerationParams, format: VideoFormat) -> GenaiResult<GeneratedScene> {
        let video: VideoResult = self
            .run_model("scene_video", &self.config.video_model, &video_request(params, format))
            .await?;
        let video = download(&self.client, "scene_video", self.max_retries, &video.video.url).await?;

        let audio = match params.narration.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(narration) => {
                let result: AudioResult = self
                    .run_model("scene_audio", &self.config.tts_model, &json!({ "prompt": narration }))
                    .await?;
                Some(download(&self.client, "scene_audio", self.max_retries, &result.audio.url).await?)
            }
            None => None,
        };

        if video.is_empty() {
            return Err(GenaiError::invalid_response("Video backend returned an empty file"));
        }

        info!(
            video_bytes = video.len(),
            has_audio = audio.is_some(),
            "Generated scene media"
        );
        Ok(GeneratedScene { video, audio })
    }
}
