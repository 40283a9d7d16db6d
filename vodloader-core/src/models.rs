use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("broadcast session {0} already ended")]
    SessionAlreadyEnded(Uuid),
    #[error("recorded part {0} already ended")]
    PartAlreadyEnded(Uuid),
    #[error("end timestamp precedes start for {0}")]
    EndBeforeStart(Uuid),
}

/// Per-channel overlay settings. Unset fields inherit the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub font_family: Option<String>,
    pub font_size: Option<u32>,
    pub font_style: Option<String>,
    pub font_weight: Option<String>,
    pub text_color: Option<String>,
    pub text_shadow_color: Option<String>,
    pub text_shadow_size: Option<u32>,
    pub overlay_width: Option<u32>,
    pub overlay_height: Option<u32>,
    pub position: Option<String>,
    pub padding: Option<u32>,
    pub message_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Platform user id.
    pub id: String,
    pub login: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub quality: Option<String>,
    #[serde(default)]
    pub overlay: OverlayStyle,
}

impl Channel {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: None,
            active: true,
            quality: None,
            overlay: OverlayStyle::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSession {
    pub id: Uuid,
    pub channel_id: String,
    pub platform_stream_id: Option<String>,
    pub title: Option<String>,
    pub category: Option<Category>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BroadcastSession {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn end(&mut self, ended_at: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.ended_at.is_some() {
            return Err(LifecycleError::SessionAlreadyEnded(self.id));
        }
        if ended_at < self.started_at {
            return Err(LifecycleError::EndBeforeStart(self.id));
        }
        self.ended_at = Some(ended_at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedPart {
    pub id: Uuid,
    pub session_id: Uuid,
    pub channel_id: String,
    /// 1-based position within the session.
    pub part_number: u32,
    pub quality: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_path: Option<PathBuf>,
}

impl RecordedPart {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_processed(&self) -> bool {
        self.output_path.is_some()
    }

    pub fn duration(&self) -> Option<StdDuration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    /// Sets the end timestamp. A part ends exactly once.
    pub fn end(&mut self, ended_at: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.ended_at.is_some() {
            return Err(LifecycleError::PartAlreadyEnded(self.id));
        }
        if ended_at < self.started_at {
            return Err(LifecycleError::EndBeforeStart(self.id));
        }
        self.ended_at = Some(ended_at);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform message id.
    pub id: String,
    pub channel_id: String,
    pub author: String,
    pub text: String,
    pub color: Option<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub moderator: bool,
    #[serde(default)]
    pub subscriber: bool,
    #[serde(default)]
    pub first_message: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub id: Uuid,
    pub channel_id: String,
    pub title: Option<String>,
    pub category: Option<Category>,
    pub recorded_at: DateTime<Utc>,
}
