//! Upstream video-platform client.
//!
//! Wraps the public search and videos endpoints behind a small client
//! struct. All outbound calls go through [`fetch_with_retry`], which
//! retries every failed attempt with doubling backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Request};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::config::YoutubeConfig;
use crate::errors::AppError;
use crate::models::VideoMetadata;

/// Fixed page size for channel search, kept small to stay inside the
/// upstream quota per invocation.
const SEARCH_PAGE_SIZE: &str = "10";

const DEFAULT_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Performs `request`, retrying on any failure (transport error or
/// non-2xx status) after the current backoff, doubling it each time.
/// `retries == 0` surfaces the first failure immediately; a budget of
/// N yields at most N + 1 attempts. Every failure is retried the same
/// way, with no status-code distinction.
pub async fn fetch_with_retry(
    client: &Client,
    request: Request,
    retries: u32,
    initial_backoff: Duration,
) -> Result<reqwest::Response, AppError> {
    let mut remaining = retries;
    let mut backoff = initial_backoff;

    loop {
        let attempt = request.try_clone().ok_or_else(|| {
            AppError::Unexpected(anyhow::anyhow!("request body cannot be cloned for retry"))
        })?;

        let failure = match client.execute(attempt).await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::anyhow!("upstream returned HTTP {}: {}", status.as_u16(), body)
            }
            Err(e) => anyhow::Error::new(e),
        };

        if remaining == 0 {
            return Err(AppError::ExternalService(failure));
        }

        warn!(
            url = %request.url(),
            remaining,
            backoff_ms = backoff.as_millis() as u64,
            error = %failure,
            "Request failed, retrying after backoff"
        );

        tokio::time::sleep(backoff).await;
        backoff *= 2;
        remaining -= 1;
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchListResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    id: SearchItemId,
    snippet: Option<VideoSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    kind: String,
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoListResponse {
    items: Vec<VideoListItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoListItem {
    id: String,
    snippet: Option<VideoSnippet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub published_at: String,
    pub channel_id: String,
    pub title: String,
    pub description: String,
    pub channel_title: String,
}

/// One video discovered upstream, before it has a processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredVideo {
    pub video_id: String,
    pub snippet: VideoSnippet,
}

impl DiscoveredVideo {
    pub fn metadata(&self) -> VideoMetadata {
        let published_at = DateTime::parse_from_rfc3339(&self.snippet.published_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        VideoMetadata {
            title: self.snippet.title.clone(),
            description: self.snippet.description.clone(),
            published_at,
            channel_title: self.snippet.channel_title.clone(),
            channel_id: self.snippet.channel_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct YoutubeClient {
    http: Client,
    config: YoutubeConfig,
}

impl YoutubeClient {
    pub fn new(config: YoutubeConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Lists the most recent videos for a channel via the search
    /// endpoint, newest first, filtered to video results.
    #[tracing::instrument(name = "Fetch recent channel videos", skip(self))]
    pub async fn recent_videos(&self, channel_id: &str) -> Result<Vec<DiscoveredVideo>, AppError> {
        let url = Url::parse_with_params(
            &format!("{}/search", self.config.base_url),
            &[
                ("key", self.config.api_key.as_str()),
                ("channelId", channel_id),
                ("part", "snippet"),
                ("order", "date"),
                ("type", "video"),
                ("maxResults", SEARCH_PAGE_SIZE),
            ],
        )?;

        let request = self.http.get(url).build()?;
        let response =
            fetch_with_retry(&self.http, request, DEFAULT_RETRIES, INITIAL_BACKOFF).await?;

        let data: SearchListResponse = response.json().await.map_err(|e| {
            tracing::error!("Failed to parse search response: {:?}", e);
            AppError::ExternalService(anyhow::Error::new(e))
        })?;

        let videos = data
            .items
            .into_iter()
            .filter(|item| item.id.kind == "youtube#video")
            .filter_map(|item| match (item.id.video_id, item.snippet) {
                (Some(video_id), Some(snippet)) => Some(DiscoveredVideo { video_id, snippet }),
                _ => None,
            })
            .collect();

        Ok(videos)
    }

    /// Looks up one video's metadata by its external identifier. Used
    /// by the manual processing path for videos not yet recorded.
    #[tracing::instrument(name = "Fetch video details", skip(self))]
    pub async fn video_details(&self, video_id: &str) -> Result<Option<DiscoveredVideo>, AppError> {
        let url = Url::parse_with_params(
            &format!("{}/videos", self.config.base_url),
            &[
                ("key", self.config.api_key.as_str()),
                ("id", video_id),
                ("part", "snippet"),
            ],
        )?;

        let request = self.http.get(url).build()?;
        let response =
            fetch_with_retry(&self.http, request, DEFAULT_RETRIES, INITIAL_BACKOFF).await?;

        let data: VideoListResponse = response.json().await.map_err(|e| {
            tracing::error!("Failed to parse videos response: {:?}", e);
            AppError::ExternalService(anyhow::Error::new(e))
        })?;

        let video = data
            .items
            .into_iter()
            .find_map(|item| match item.snippet {
                Some(snippet) => Some(DiscoveredVideo {
                    video_id: item.id,
                    snippet,
                }),
                None => None,
            });

        Ok(video)
    }
}
