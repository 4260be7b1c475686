//! Script writing via an OpenAI-compatible chat completion endpoint.

use async_trait::async_trait;
use reel_models::{GenerationConfig, Script, VideoFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ScriptWriterConfig;
use crate::error::{GenaiError, GenaiResult};
use crate::http::send_with_retry;

/// Turns a topic into a scene-by-scene script.
#[async_trait]
pub trait ScriptWriter: Send + Sync {
    async fn write_script(&self, topic: &str, config: &GenerationConfig) -> GenaiResult<Script>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a short-form video scriptwriter. You write vivid, \
visual scene descriptions that a text-to-video model can render, and concise narration \
that fits each scene's duration.";

/// [`ScriptWriter`] backed by a chat completion API.
pub struct ChatScriptWriter {
    client: Client,
    config: ScriptWriterConfig,
    max_retries: u32,
}

impl ChatScriptWriter {
    pub fn new(client: Client, config: ScriptWriterConfig, max_retries: u32) -> Self {
        Self {
            client,
            config,
            max_retries,
        }
    }

    fn build_prompt(topic: &str, config: &GenerationConfig) -> String {
        let orientation = match config.video_format {
            VideoFormat::Regular => "landscape 16:9",
            VideoFormat::Short => "vertical 9:16",
        };
        let style = config
            .style
            .as_deref()
            .map(|s| format!("\nVisual style: {s}"))
            .unwrap_or_default();

        format!(
            r#"Write a video script about the following topic.

TOPIC:
{topic}

Target total duration: {duration} seconds.
Framing: {orientation}.{style}

Return ONLY a single JSON object with this schema:
{{
  "title": "Catchy video title (max 100 characters)",
  "summary": "One or two sentence description of the video",
  "hashtags": ["tag1", "tag2"],
  "scenes": [
    {{
      "description": "What the camera shows in this scene",
      "narration": "What the narrator says during this scene",
      "duration_secs": 5
    }}
  ]
}}

Additional instructions:
- Write between {min} and {max} scenes.
- Scene durations must add up to roughly {duration} seconds.
- Hashtags are single words without the # symbol.
"#,
            topic = topic,
            duration = config.duration_secs,
            orientation = orientation,
            style = style,
            min = config.min_scenes,
            max = config.max_scenes,
        )
    }
}

#[async_trait]
impl ScriptWriter for ChatScriptWriter {
    async fn write_script(&self, topic: &str, config: &GenerationConfig) -> GenaiResult<Script> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_prompt(topic, config),
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            stream: false,
        };

        info!(model = %self.config.model, "Requesting script");
        let response = send_with_retry("script", self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
        })
        .await?;

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenaiError::invalid_response(format!("Failed to parse chat response: {e}")))?;

        let text = chat
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| GenaiError::invalid_response("No content in chat response"))?;

        debug!(length = text.len(), "Received script text");
        parse_script(text)
    }
}

/// Parse model output as a [`Script`], tolerating a markdown code fence.
pub fn parse_script(text: &str) -> GenaiResult<Script> {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);

    let script: Script = serde_json::from_str(text.trim())
        .map_err(|e| GenaiError::invalid_response(format!("Failed to parse script JSON: {e}")))?;

    if script.scenes.iter().any(|s| s.description.trim().is_empty()) {
        return Err(GenaiError::invalid_response("Script contains a scene without a description"));
    }

    Ok(script)
}
