//! Boundaries to the streaming platform and the upload stage.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{Category, Channel};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Request(String),
    #[error("unsupported stream quality: {0}")]
    InvalidQuality(String),
}

#[derive(Debug, Error)]
#[error("upload hand-off failed: {0}")]
pub struct UploadError(pub String);

/// Live-stream metadata as reported by the platform at the time of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStreamInfo {
    pub platform_stream_id: Option<String>,
    pub title: Option<String>,
    pub category: Option<Category>,
    pub started_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait PlatformClient: Send + Sync {
    /// `Ok(None)` when the channel is not live.
    async fn current_stream(&self, channel: &Channel)
        -> Result<Option<LiveStreamInfo>, PlatformError>;
}

/// Answers every query with the same stream info. Used when a recording is
/// started by hand and no platform lookup is wanted.
#[derive(Debug, Clone)]
pub struct FixedStreamInfo {
    info: LiveStreamInfo,
}

impl FixedStreamInfo {
    pub fn new(title: Option<String>) -> Self {
        Self {
            info: LiveStreamInfo {
                platform_stream_id: None,
                title,
                category: None,
                started_at: Utc::now(),
            },
        }
    }
}

#[async_trait::async_trait]
impl PlatformClient for FixedStreamInfo {
    async fn current_stream(
        &self,
        _channel: &Channel,
    ) -> Result<Option<LiveStreamInfo>, PlatformError> {
        Ok(Some(self.info.clone()))
    }
}

#[async_trait::async_trait]
pub trait UploadSink: Send + Sync {
    async fn enqueue_for_upload(&self, part_id: Uuid, output_path: &Path)
        -> Result<(), UploadError>;
}

/// Logs the hand-off; stands in when no uploader is wired.
#[derive(Debug, Default)]
pub struct LogUploadSink;

#[async_trait::async_trait]
impl UploadSink for LogUploadSink {
    async fn enqueue_for_upload(
        &self,
        part_id: Uuid,
        output_path: &Path,
    ) -> Result<(), UploadError> {
        info!(part_id = %part_id, path = %output_path.display(), "output ready for upload");
        Ok(())
    }
}

/// Stream quality accepted by the fetchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quality(String);

impl Quality {
    const VALID: [&'static str; 11] = [
        "best",
        "worst",
        "source",
        "1080p60",
        "1080p",
        "720p60",
        "720p",
        "480p",
        "360p",
        "160p",
        "audio_only",
    ];

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self("best".to_string())
    }
}

impl FromStr for Quality {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if Self::VALID.contains(&normalized.as_str()) {
            Ok(Self(normalized))
        } else {
            Err(PlatformError::InvalidQuality(s.to_string()))
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_accepts_known_values() {
        assert_eq!("720p".parse::<Quality>().unwrap().as_str(), "720p");
        assert_eq!(" BEST ".parse::<Quality>().unwrap().as_str(), "best");
        assert!(matches!(
            "4k".parse::<Quality>(),
            Err(PlatformError::InvalidQuality(_))
        ));
    }
}
