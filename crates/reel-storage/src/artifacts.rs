//! Artifact key layout and the small JSON documents stored next to media.
//!
//! Keys are deterministic per job and scene so every write is an
//! overwrite-by-key and a redelivered stage finds its own earlier output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reel_models::JobId;

pub fn job_prefix(job_id: &JobId) -> String {
    format!("jobs/{}/", job_id)
}

pub fn script_key(job_id: &JobId) -> String {
    format!("jobs/{}/script.json", job_id)
}

pub fn scene_prefix(job_id: &JobId, scene_index: u32) -> String {
    format!("jobs/{}/scenes/{:04}/", job_id, scene_index)
}

pub fn scene_video_key(job_id: &JobId, scene_index: u32) -> String {
    format!("{}video.mp4", scene_prefix(job_id, scene_index))
}

pub fn scene_audio_key(job_id: &JobId, scene_index: u32) -> String {
    format!("{}audio.mp3", scene_prefix(job_id, scene_index))
}

/// Written last for a scene; its key is the scene's artifact reference.
pub fn scene_manifest_key(job_id: &JobId, scene_index: u32) -> String {
    format!("{}manifest.json", scene_prefix(job_id, scene_index))
}

pub fn composed_key(job_id: &JobId) -> String {
    format!("jobs/{}/final.mp4", job_id)
}

pub fn publish_receipt_key(job_id: &JobId) -> String {
    format!("jobs/{}/publish.json", job_id)
}

/// Media produced for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneManifest {
    pub job_id: JobId,
    pub scene_index: u32,
    pub video_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_key: Option<String>,
    pub duration_secs: u32,
    pub generated_at: DateTime<Utc>,
}

/// Result of a successful upload to the destination platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub job_id: JobId,
    pub platform_id: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}
