use crate::errors::AppError;

const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Upstream API configuration, read once at startup and passed down
/// explicitly. A missing key aborts startup rather than failing on the
/// first sync pass.
#[derive(Debug, Clone)]
pub struct YoutubeConfig {
    pub api_key: String,
    pub base_url: String,
}

impl YoutubeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var("YOUTUBE_API_KEY")
            .map_err(|_| AppError::Configuration("YOUTUBE_API_KEY is not set".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(AppError::Configuration(
                "YOUTUBE_API_KEY is empty".to_string(),
            ));
        }

        let base_url = std::env::var("YOUTUBE_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());

        Ok(Self { api_key, base_url })
    }

    /// Used by tests to point the client at a local stub server.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}
