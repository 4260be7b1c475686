//! Publishing composed videos to YouTube.
//!
//! Uses a long-lived OAuth refresh token to mint an access token per upload,
//! then the Data API's resumable upload protocol in a single chunk.

use std::path::Path;

use async_trait::async_trait;
use reel_models::Script;
use reqwest::header::LOCATION;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use url::Url;

use crate::config::YoutubeConfig;
use crate::error::{GenaiError, GenaiResult};
use crate::http::send_with_retry;

/// YouTube's limits on title and tag text.
const MAX_TITLE_CHARS: usize = 100;
const MAX_TAGS_CHARS: usize = 500;
/// "People & Blogs"
const CATEGORY_ID: &str = "22";

/// Upload metadata derived from a script.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl PublishMetadata {
    pub fn from_script(script: &Script) -> Self {
        let title: String = script.title.trim().chars().take(MAX_TITLE_CHARS).collect();

        let mut tags = Vec::new();
        let mut budget = MAX_TAGS_CHARS;
        for tag in &script.hashtags {
            let tag = tag.trim().trim_start_matches('#').trim();
            if tag.is_empty() || tag.len() > budget {
                continue;
            }
            budget -= tag.len();
            tags.push(tag.to_string());
        }

        Self {
            title,
            description: script.description(),
            tags,
        }
    }
}

/// Where the video ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedVideo {
    pub platform_id: String,
    pub url: String,
}

/// Uploads a composed video.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, video: &Path, metadata: &PublishMetadata) -> GenaiResult<PublishedVideo>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
}

/// [`Publisher`] backed by the YouTube Data API v3.
pub struct YoutubePublisher {
    client: Client,
    config: YoutubeConfig,
    max_retries: u32,
}

impl YoutubePublisher {
    pub fn new(client: Client, config: YoutubeConfig, max_retries: u32) -> Self {
        Self {
            client,
            config,
            max_retries,
        }
    }

    async fn access_token(&self) -> GenaiResult<String> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", self.config.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = send_with_retry("youtube_token", self.max_retries, || {
            self.client.post(&self.config.token_uri).form(&form)
        })
        .await?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GenaiError::invalid_response(format!("Failed to parse token response: {e}")))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl Publisher for YoutubePublisher {
    async fn publish(&self, video: &Path, metadata: &PublishMetadata) -> GenaiResult<PublishedVideo> {
        let bytes = tokio::fs::read(video).await?;
        let token = self.access_token().await?;

        let init_url = format!(
            "{}/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status",
            self.config.api_base.trim_end_matches('/')
        );
        let resource = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "tags": metadata.tags,
                "categoryId": CATEGORY_ID,
            },
            "status": {
                "privacyStatus": self.config.privacy_status,
                "selfDeclaredMadeForKids": false,
            }
        });

        let init = send_with_retry("youtube_upload", self.max_retries, || {
            self.client
                .post(&init_url)
                .bearer_auth(&token)
                .header("X-Upload-Content-Type", "video/mp4")
                .header("X-Upload-Content-Length", bytes.len().to_string())
                .json(&resource)
        })
        .await?;

        let session = init
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GenaiError::invalid_response("Upload session has no Location header"))?;
        let session = Url::parse(session)
            .map_err(|e| GenaiError::invalid_response(format!("Invalid upload session URL: {e}")))?;

        let response = send_with_retry("youtube_upload", self.max_retries, || {
            self.client
                .put(session.clone())
                .bearer_auth(&token)
                .header("Content-Type", "video/mp4")
                .body(bytes.clone())
        })
        .await?;

        let uploaded: VideoResource = response
            .json()
            .await
            .map_err(|e| GenaiError::invalid_response(format!("Failed to parse upload response: {e}")))?;

        let url = format!("https://www.youtube.com/watch?v={}", uploaded.id);
        info!(video_id = %uploaded.id, "Uploaded video to YouTube");
        Ok(PublishedVideo {
            platform_id: uploaded.id,
            url,
        })
    }
}
