//! Generation configuration, scripts and per-scene parameters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Output quality tier requested at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Standard,
    High,
    Premium,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Standard => "standard",
            Quality::High => "high",
            Quality::Premium => "premium",
        }
    }

    /// Parse from the request string. Unknown values return `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "standard" => Some(Quality::Standard),
            "high" => Some(Quality::High),
            "premium" => Some(Quality::Premium),
            _ => None,
        }
    }
}

/// Output format of the composed video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoFormat {
    /// Landscape 16:9
    #[default]
    Regular,
    /// Vertical 9:16
    Short,
}

impl VideoFormat {
    /// Output frame size as `(width, height)`.
    pub fn frame_size(&self) -> (u32, u32) {
        match self {
            VideoFormat::Regular => (1920, 1080),
            VideoFormat::Short => (1080, 1920),
        }
    }
}

/// Generation configuration fixed at submission time.
///
/// Scene count bounds are copied from the submission policy so that
/// workers see the bounds that were in force when the job was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GenerationConfig {
    /// Target total duration of the composed video, in seconds
    pub duration_secs: u32,
    pub quality: Quality,
    #[serde(default)]
    pub video_format: VideoFormat,
    /// Free-form style hint passed to the backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    pub min_scenes: u32,
    pub max_scenes: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            duration_secs: 30,
            quality: Quality::Standard,
            video_format: VideoFormat::Regular,
            style: None,
            min_scenes: 1,
            max_scenes: 12,
        }
    }
}

/// Per-scene generation parameters carried by a fan-out message.
///
/// The coordinator never interprets these; `extra` keeps whatever the
/// script writer attached so it round-trips to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GenerationParams {
    pub prompt: String,
    pub duration_secs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Narration text spoken over this scene
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            prompt: prompt.into(),
            duration_secs,
            style: None,
            narration: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_narration(mut self, narration: impl Into<String>) -> Self {
        self.narration = Some(narration.into());
        self
    }
}

/// One scene as written by the script stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptScene {
    /// Visual description used as the generation prompt
    pub description: String,
    #[serde(default)]
    pub narration: Option<String>,
    pub duration_secs: u32,
}

/// Script produced for a job; persisted to object storage before fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Script {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub scenes: Vec<ScriptScene>,
}

impl Script {
    pub fn scene_count(&self) -> u32 {
        self.scenes.len() as u32
    }

    /// Drop scenes beyond `max_scenes`.
    pub fn truncate_scenes(&mut self, max_scenes: u32) {
        self.scenes.truncate(max_scenes as usize);
    }

    /// Build the fan-out parameters for each scene, in scene order.
    pub fn scene_params(&self, style: Option<&str>) -> Vec<GenerationParams> {
        self.scenes
            .iter()
            .map(|scene| {
                let mut params = GenerationParams::new(&scene.description, scene.duration_secs);
                params.style = style.map(str::to_string);
                params.narration = scene.narration.clone().filter(|n| !n.trim().is_empty());
                params
            })
            .collect()
    }

    /// Upload description: summary followed by hashtags.
    pub fn description(&self) -> String {
        if self.hashtags.is_empty() {
            return self.summary.clone();
        }
        let tags: Vec<String> = self
            .hashtags
            .iter()
            .map(|t| format!("#{}", t.trim_start_matches('#')))
            .collect();
        format!("{}\n\n{}", self.summary, tags.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        Script {
            title: "Tides".to_string(),
            summary: "How the moon moves the sea".to_string(),
            hashtags: vec!["science".to_string(), "#ocean".to_string()],
            scenes: vec![
                ScriptScene {
                    description: "Moon over water".to_string(),
                    narration: Some("The moon pulls.".to_string()),
                    duration_secs: 10,
                },
                ScriptScene {
                    description: "Beach at low tide".to_string(),
                    narration: Some("  ".to_string()),
                    duration_secs: 10,
                },
            ],
        }
    }

    #[test]
    fn test_scene_params_keep_order_and_drop_blank_narration() {
        let params = script().scene_params(Some("cinematic"));
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].prompt, "Moon over water");
        assert_eq!(params[0].narration.as_deref(), Some("The moon pulls."));
        assert_eq!(params[1].narration, None);
        assert_eq!(params[1].style.as_deref(), Some("cinematic"));
    }

    #[test]
    fn test_description_formats_hashtags() {
        assert_eq!(
            script().description(),
            "How the moon moves the sea\n\n#science #ocean"
        );
    }

    #[test]
    fn test_params_keep_unknown_fields() {
        let json = r#"{"prompt":"p","duration_secs":5,"camera":"dolly"}"#;
        let params: GenerationParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.extra.get("camera").and_then(|v| v.as_str()), Some("dolly"));
        let back = serde_json::to_value(&params).unwrap();
        assert_eq!(back["camera"], "dolly");
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!(Quality::parse("HIGH"), Some(Quality::High));
        assert_eq!(Quality::parse("ultra"), None);
    }
}
