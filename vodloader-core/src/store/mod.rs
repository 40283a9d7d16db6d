//! Persistence contract for channels, broadcast sessions, recorded parts and
//! chat messages. The capture and post-processing code only talks to
//! [`CaptureStore`]; the backing engine is picked at startup from
//! `[store].backend`.

mod memory;
mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{StoreBackend, StoreSection};
use crate::error::{Classify, FailureClass};
use crate::models::{
    BroadcastSession, Category, Channel, ChatMessage, LifecycleError, MetadataUpdate,
    RecordedPart,
};

pub use memory::MemoryCaptureStore;
pub use sqlite::{SqliteCaptureStore, SqliteCaptureStoreBuilder};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on store database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("store path not configured")]
    MissingStore,
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for StoreError {
    fn class(&self) -> FailureClass {
        match self {
            StoreError::NotFound { .. } | StoreError::Lifecycle(_) => {
                FailureClass::DataInconsistency
            }
            _ => FailureClass::Internal,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub active_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub channel_id: Option<String>,
    pub open_only: bool,
    pub limit: Option<usize>,
}

/// Parts always come back in ascending start order.
#[derive(Debug, Clone, Default)]
pub struct PartFilter {
    pub session_id: Option<Uuid>,
    pub channel_id: Option<String>,
    pub ended_only: bool,
    pub unprocessed_only: bool,
    pub limit: Option<usize>,
}

impl PartFilter {
    /// Ended parts that still lack a post-processed output.
    pub fn pending_post_process() -> Self {
        Self {
            ended_only: true,
            unprocessed_only: true,
            ..Self::default()
        }
    }

    fn matches(&self, part: &RecordedPart) -> bool {
        self.session_id.map_or(true, |id| part.session_id == id)
            && self
                .channel_id
                .as_deref()
                .map_or(true, |id| part.channel_id == id)
            && (!self.ended_only || part.is_ended())
            && (!self.unprocessed_only || !part.is_processed())
    }
}

pub trait CaptureStore: Send + Sync + std::fmt::Debug {
    fn get_channel(&self, id: &str) -> StoreResult<Option<Channel>>;
    fn list_channels(&self, filter: &ChannelFilter) -> StoreResult<Vec<Channel>>;
    fn save_channel(&self, channel: &Channel) -> StoreResult<()>;
    fn delete_channel(&self, id: &str) -> StoreResult<bool>;

    fn create_session(&self, session: &BroadcastSession) -> StoreResult<()>;
    fn get_session(&self, id: Uuid) -> StoreResult<Option<BroadcastSession>>;
    /// Ascending by start time.
    fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<BroadcastSession>>;
    /// Rejects sessions that already ended.
    fn update_session_metadata(
        &self,
        id: Uuid,
        title: Option<&str>,
        category: Option<&Category>,
    ) -> StoreResult<()>;
    /// Sets the end timestamp; a second call fails with
    /// [`LifecycleError::SessionAlreadyEnded`].
    fn end_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()>;
    fn record_metadata_update(&self, update: &MetadataUpdate) -> StoreResult<()>;

    fn create_part(&self, part: &RecordedPart) -> StoreResult<()>;
    fn get_part(&self, id: Uuid) -> StoreResult<Option<RecordedPart>>;
    fn list_parts(&self, filter: &PartFilter) -> StoreResult<Vec<RecordedPart>>;
    /// Sets the end timestamp; a second call fails with
    /// [`LifecycleError::PartAlreadyEnded`].
    fn end_part(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()>;
    fn set_part_output(&self, id: Uuid, output: &Path) -> StoreResult<()>;
    fn delete_part(&self, id: Uuid) -> StoreResult<bool>;

    /// Returns `false` when a message with the same platform id exists.
    fn save_chat_message(&self, message: &ChatMessage) -> StoreResult<bool>;
    /// Messages of `channel_id` within `[start, end]`, ascending by timestamp.
    fn chat_messages_between(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ChatMessage>>;
}

/// Opens the backend selected by configuration.
pub fn open_store(section: &StoreSection) -> StoreResult<Arc<dyn CaptureStore>> {
    match section.backend {
        StoreBackend::Sqlite => {
            let store = SqliteCaptureStore::builder()
                .path(&section.path)
                .create_if_missing(true)
                .build()?;
            store.initialize()?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryCaptureStore::new())),
    }
}
