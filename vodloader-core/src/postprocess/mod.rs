//! Turns finalized capture parts into published outputs: remux when the
//! part had no chat, otherwise cut ads, render the chat overlay and compose.

mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ads::{AdDetector, AdError, AdRemoval, DetectionReport};
use crate::compositor::{
    ComposeJob, CompositorError, FrameSource, NoOverlay, StreamingCompositor,
};
use crate::config::{OverlaySection, VodloaderConfig};
use crate::error::{Classify, FailureClass};
use crate::models::{Channel, ChatMessage, RecordedPart};
use crate::overlay::{
    apply_channel_config, prepare_messages, ChatOverlayRenderer, OverlayError, RasterPool,
    SurfaceProvider,
};
use crate::platform::UploadSink;
use crate::probe::{MediaProbe, ProbeError};
use crate::queue::{PostProcessQueue, QueueEntry, QueueError};
use crate::store::{CaptureStore, StoreError};

pub use worker::{recover_pending, PostProcessWorkers, RecoveryReport};

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("part {0} not found in store")]
    MissingPart(Uuid),
    #[error("part {0} has not ended")]
    PartNotEnded(Uuid),
    #[error("capture file missing: {0}")]
    MissingInput(PathBuf),
    #[error("post-processing cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Ads(#[from] AdError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Compositor(#[from] CompositorError),
    #[error("worker task failed: {0}")]
    Task(String),
}

impl Classify for PostProcessError {
    fn class(&self) -> FailureClass {
        match self {
            PostProcessError::MissingPart(_)
            | PostProcessError::PartNotEnded(_)
            | PostProcessError::MissingInput(_) => FailureClass::DataInconsistency,
            PostProcessError::Store(err) => err.class(),
            PostProcessError::Ads(err) => err.class(),
            PostProcessError::Overlay(err) => err.class(),
            PostProcessError::Compositor(err) => err.class(),
            PostProcessError::Probe(_) => FailureClass::CompositionFailure,
            PostProcessError::Cancelled => FailureClass::CompositionFailure,
            PostProcessError::Queue(_) | PostProcessError::Task(_) => FailureClass::Internal,
        }
    }
}

impl PostProcessError {
    /// Whether a later queue pass may pick the part up again on its own.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PostProcessError::Cancelled | PostProcessError::Compositor(CompositorError::Cancelled)
        )
    }
}

pub type PostProcessResult<T> = Result<T, PostProcessError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessKind {
    /// The part already had an output from an earlier pass.
    AlreadyProcessed,
    /// No chat in the part's window; streams copied into a new container.
    Remuxed,
    Composited {
        messages: usize,
        frames: u64,
        failed_frames: u64,
        ad_seconds_removed: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub part_id: Uuid,
    pub output: PathBuf,
    pub kind: ProcessKind,
}

/// Owns the post-processing pipeline for one process. Shared by every
/// worker through an `Arc`.
pub struct PostProcessor {
    store: Arc<dyn CaptureStore>,
    queue: PostProcessQueue,
    surfaces: Arc<dyn SurfaceProvider>,
    upload: Arc<dyn UploadSink>,
    probe: MediaProbe,
    ads: AdDetector,
    ads_enabled: bool,
    compositor: StreamingCompositor,
    overlay: OverlaySection,
    pool: RasterPool,
}

impl std::fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessor")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .field("ads_enabled", &self.ads_enabled)
            .field("compositor", &self.compositor)
            .finish()
    }
}

impl PostProcessor {
    pub fn new(
        config: &VodloaderConfig,
        store: Arc<dyn CaptureStore>,
        queue: PostProcessQueue,
        surfaces: Arc<dyn SurfaceProvider>,
        upload: Arc<dyn UploadSink>,
    ) -> Self {
        let probe_timeout = Duration::from_secs(config.ad_detection.probe_timeout_seconds.max(1));
        Self {
            store,
            queue,
            surfaces,
            upload,
            probe: MediaProbe::new(&config.paths.ffprobe, probe_timeout),
            ads: AdDetector::new(&config.paths, &config.ad_detection, &config.encoder),
            ads_enabled: config.ad_detection.enabled,
            compositor: StreamingCompositor::new(&config.paths.ffmpeg, config.encoder.clone()),
            overlay: config.overlay.clone(),
            pool: RasterPool::default(),
        }
    }

    pub fn with_pool(mut self, pool: RasterPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn queue(&self) -> &PostProcessQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn CaptureStore> {
        &self.store
    }

    /// Processes one claimed queue entry and records the result on the
    /// queue. Failures are logged here and never propagate to the caller.
    pub async fn handle(&self, entry: &QueueEntry, cancel: &CancellationToken) {
        let outcome = self.process(entry, cancel).await;
        self.settle(entry, outcome).await;
    }

    async fn settle(&self, entry: &QueueEntry, outcome: PostProcessResult<ProcessOutcome>) {
        match outcome {
            Ok(outcome) => {
                if let Err(err) = self.queue.store().mark_done(entry.id, &outcome.output) {
                    warn!(entry = entry.id, error = %err, "failed to mark queue entry done");
                }
                info!(
                    part_id = %entry.part_id,
                    output = %outcome.output.display(),
                    kind = ?outcome.kind,
                    "post-processing finished"
                );
                if outcome.kind != ProcessKind::AlreadyProcessed {
                    if let Err(err) = self
                        .upload
                        .enqueue_for_upload(outcome.part_id, &outcome.output)
                        .await
                    {
                        warn!(part_id = %entry.part_id, error = %err, "upload hand-off failed");
                    }
                }
            }
            Err(err) if err.is_cancellation() => {
                // left in `processing`; the next startup requeues it
                info!(part_id = %entry.part_id, "post-processing interrupted by shutdown");
            }
            Err(err) => {
                let class = err.class();
                warn!(
                    part_id = %entry.part_id,
                    path = %entry.path.display(),
                    class = %class,
                    attempts = entry.attempts,
                    error = %err,
                    "post-processing failed; original kept"
                );
                let reason = format!("{class}: {err}");
                let retryable = err.is_retryable();
                if let Err(mark_err) = self.queue.store().mark_failed(entry.id, &reason, retryable) {
                    warn!(entry = entry.id, error = %mark_err, "failed to mark queue entry failed");
                }
            }
        }
    }

    /// Runs the pipeline for `entry`. The original capture is deleted only
    /// after the output path is persisted.
    pub async fn process(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> PostProcessResult<ProcessOutcome> {
        let part = self
            .store
            .get_part(entry.part_id)?
            .ok_or(PostProcessError::MissingPart(entry.part_id))?;
        if let Some(output) = &part.output_path {
            debug!(part_id = %part.id, "part already processed");
            return Ok(ProcessOutcome {
                part_id: part.id,
                output: output.clone(),
                kind: ProcessKind::AlreadyProcessed,
            });
        }
        let ended_at = part.ended_at.ok_or(PostProcessError::PartNotEnded(part.id))?;
        if !tokio::fs::try_exists(&part.path).await.unwrap_or(false) {
            return Err(PostProcessError::MissingInput(part.path.clone()));
        }

        let messages =
            self.store
                .chat_messages_between(&part.channel_id, part.started_at, ended_at)?;
        let output = output_path_for(&part.path);
        info!(
            part_id = %part.id,
            channel = %part.channel_id,
            part_number = part.part_number,
            messages = messages.len(),
            "post-processing part"
        );

        let mut intermediate = None;
        let result = if messages.is_empty() {
            self.remux(&part, &output, cancel).await
        } else {
            self.compose_with_chat(&part, messages, &output, &mut intermediate, cancel)
                .await
        };
        if let Some(path) = &intermediate {
            remove_file_logged(path).await;
        }
        let kind = match result {
            Ok(kind) => kind,
            Err(err) => {
                remove_file_logged(&output).await;
                return Err(err);
            }
        };

        self.store.set_part_output(part.id, &output)?;
        remove_file_logged(&part.path).await;
        Ok(ProcessOutcome {
            part_id: part.id,
            output,
            kind,
        })
    }

    async fn remux(
        &self,
        part: &RecordedPart,
        output: &Path,
        cancel: &CancellationToken,
    ) -> PostProcessResult<ProcessKind> {
        let duration = part
            .duration()
            .map(|duration| duration.as_secs_f64())
            .unwrap_or_default();
        let job = ComposeJob {
            input: part.path.clone(),
            output: output.to_path_buf(),
            overlay_x: 0,
            overlay_y: 0,
            duration_seconds: duration,
        };
        self.compositor.compose(&job, &mut NoOverlay, cancel).await?;
        Ok(ProcessKind::Remuxed)
    }

    async fn compose_with_chat(
        &self,
        part: &RecordedPart,
        messages: Vec<ChatMessage>,
        output: &Path,
        intermediate: &mut Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> PostProcessResult<ProcessKind> {
        let mut source = part.path.clone();
        let mut messages = messages;
        let mut ad_seconds_removed = 0.0;
        if self.ads_enabled {
            let no_ads = intermediate_path_for(&part.path);
            *intermediate = Some(no_ads.clone());
            let removal = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PostProcessError::Cancelled),
                removal = self.ads.remove_ads(&part.path, &no_ads) => removal?,
            };
            if let AdRemoval::Removed { report, output } = removal {
                ad_seconds_removed = report.ad_seconds();
                messages = shift_past_removed_ads(messages, part.started_at, &report);
                source = output;
            }
        }

        let video = self.probe.video_info(&source).await?;
        let channel = self
            .store
            .get_channel(&part.channel_id)?
            .unwrap_or_else(|| Channel::new(&part.channel_id, &part.channel_id));
        let config = apply_channel_config(&channel, &self.overlay);
        let fps = config.frame_rate.unwrap_or(video.fps);
        let prepared = prepare_messages(&messages, part.started_at, video.duration_seconds);
        let renderer =
            ChatOverlayRenderer::new(config, &video, &prepared).with_pool(self.pool.clone());
        let layout = *renderer.layout();
        let mut frames = renderer
            .frames(self.surfaces.as_ref(), video.duration_seconds, fps)
            .await?;

        let job = ComposeJob {
            input: source,
            output: output.to_path_buf(),
            overlay_x: layout.x,
            overlay_y: layout.y,
            duration_seconds: video.duration_seconds,
        };
        self.compositor.compose(&job, &mut frames, cancel).await?;
        if frames.failures() > 0 {
            warn!(
                part_id = %part.id,
                failed_frames = frames.failures(),
                "overlay composed with skipped frames"
            );
        }
        Ok(ProcessKind::Composited {
            messages: prepared.len(),
            frames: frames.total_frames(),
            failed_frames: frames.failures(),
            ad_seconds_removed,
        })
    }
}

/// `<stem>.mp4` next to the capture, or `<stem>.final.mp4` when the capture
/// already is an mp4.
pub fn output_path_for(input: &Path) -> PathBuf {
    if input.extension().is_some_and(|ext| ext == "mp4") {
        input.with_extension("final.mp4")
    } else {
        input.with_extension("mp4")
    }
}

fn intermediate_path_for(input: &Path) -> PathBuf {
    input.with_extension("no_ads.mp4")
}

/// Moves chat timestamps onto the ad-free timeline. Messages sent during an
/// ad are dropped.
fn shift_past_removed_ads(
    messages: Vec<ChatMessage>,
    start: DateTime<Utc>,
    report: &DetectionReport,
) -> Vec<ChatMessage> {
    let before = messages.len();
    let shifted: Vec<ChatMessage> = messages
        .into_iter()
        .filter_map(|mut message| {
            let micros = (message.timestamp - start).num_microseconds()?;
            let offset = report.remap_offset(micros as f64 / 1_000_000.0)?;
            message.timestamp = start + chrono::Duration::microseconds((offset * 1e6).round() as i64);
            Some(message)
        })
        .collect();
    if shifted.len() < before {
        debug!(dropped = before - shifted.len(), "chat messages sent during ads dropped");
    }
    shifted
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}
