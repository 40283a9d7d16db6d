//! Per-broadcast recording: one [`CaptureSession`] turns a live stream into
//! an ordered series of finalized part files.

mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{CaptureSection, PathsSection};
use crate::error::{Classify, FailureClass};
use crate::fetcher::{FetchError, StreamFetcher};
use crate::platform::{PlatformClient, PlatformError};
use crate::queue::{PostProcessQueue, QueueError};
use crate::store::{CaptureStore, StoreError};

pub use session::{CaptureHandle, CaptureSession};
pub use state::CaptureState;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("stream info for {channel} unavailable after {attempts} attempts")]
    StreamUnretrievable { channel: String, attempts: u32 },
    #[error("invalid capture transition {from} -> {to}")]
    InvalidTransition {
        from: CaptureState,
        to: CaptureState,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to open stream: {0}")]
    Fetch(#[from] FetchError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("capture task failed: {0}")]
    Task(String),
}

impl Classify for CaptureError {
    fn class(&self) -> FailureClass {
        match self {
            CaptureError::StreamUnretrievable { .. } => FailureClass::UpstreamUnavailable,
            CaptureError::Fetch(_) => FailureClass::TransientIo,
            CaptureError::Store(err) => err.class(),
            _ => FailureClass::Internal,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Exponential backoff with a little jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay
            .saturating_sub(Duration::from_millis(jitter_ms / 2))
            .saturating_add(Duration::from_millis(jitter))
            .min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub download_dir: PathBuf,
    pub default_quality: String,
    pub cutoff: Duration,
    pub metadata_retry: Backoff,
    pub read_retry_attempts: u32,
    pub read_retry_delay: Duration,
    pub stop_grace: Duration,
}

impl CaptureSettings {
    pub fn from_config(paths: &PathsSection, capture: &CaptureSection) -> Self {
        Self {
            download_dir: paths.download_dir.clone(),
            default_quality: capture.quality.clone(),
            cutoff: capture.cutoff(),
            metadata_retry: Backoff {
                attempts: capture.metadata_retry_attempts.max(1),
                base: Duration::from_millis(capture.metadata_retry_base_ms),
                max: Duration::from_millis(capture.metadata_retry_max_ms),
            },
            read_retry_attempts: capture.read_retry_attempts,
            read_retry_delay: Duration::from_millis(capture.read_retry_delay_ms),
            stop_grace: capture.stop_grace(),
        }
    }
}

/// Collaborators shared by every capture session of the process.
pub struct CaptureContext {
    pub store: Arc<dyn CaptureStore>,
    pub platform: Arc<dyn PlatformClient>,
    pub fetcher: Arc<dyn StreamFetcher>,
    pub queue: PostProcessQueue,
    pub settings: CaptureSettings,
}

impl std::fmt::Debug for CaptureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureContext")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .field("settings", &self.settings)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    ReadRetriesExhausted { attempts: u32, last_error: String },
    WriteFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartSummary {
    pub part_id: Uuid,
    pub part_number: u32,
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
    /// False when finalization did not complete within the stop grace.
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub channel_id: String,
    pub session_id: Option<Uuid>,
    pub final_state: CaptureState,
    pub abort_reason: Option<AbortReason>,
    pub parts: Vec<PartSummary>,
}

impl CaptureReport {
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|part| part.bytes).sum()
    }
}
