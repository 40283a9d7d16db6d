#![cfg(unix)]

use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vodloader_core::config::VodloaderConfig;
use vodloader_core::models::{BroadcastSession, Channel, ChatMessage, RecordedPart};
use vodloader_core::browser::BrowserError;
use vodloader_core::overlay::{
    FrameLayout, OverlayError, OverlayResult, RenderSurface, SurfaceProvider,
};
use vodloader_core::platform::{UploadError, UploadSink};
use vodloader_core::postprocess::{
    recover_pending, PostProcessWorkers, PostProcessor, ProcessKind,
};
use vodloader_core::queue::{PostProcessQueue, QueueStatus, QueueStore};
use vodloader_core::store::{CaptureStore, MemoryCaptureStore};

const FFPROBE: &str = r#"cat <<'EOF'
{"streams":[{"codec_type":"video","width":1280,"height":720,"avg_frame_rate":"10/1"},{"codec_type":"audio"}],"format":{"duration":"2.0"}}
EOF"#;

// Copies stdin into the last argument, then appends a marker byte.
const FFMPEG: &str = "for last; do :; done\ncat > \"$last\"\nprintf x >> \"$last\"";

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct SolidSurface {
    width: u32,
    height: u32,
    renders: Arc<AtomicUsize>,
    heap_exhausted: bool,
}

#[async_trait::async_trait]
impl RenderSurface for SolidSurface {
    async fn render(&mut self, _frame: &FrameLayout) -> OverlayResult<Vec<u8>> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if self.heap_exhausted {
            return Err(OverlayError::Browser(BrowserError::ResourceExceeded {
                used_mb: 4096,
                limit_mb: 2048,
            }));
        }
        let image = RgbaImage::from_pixel(self.width, self.height, Rgba([0, 0, 0, 0]));
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image).write_to(&mut png, ImageOutputFormat::Png)?;
        Ok(png.into_inner())
    }

    async fn close(self: Box<Self>) -> OverlayResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct SolidProvider {
    opened: AtomicUsize,
    renders: Arc<AtomicUsize>,
    heap_exhausted: bool,
}

#[async_trait::async_trait]
impl SurfaceProvider for SolidProvider {
    async fn open_surface(
        &self,
        _document: &str,
        width: u32,
        height: u32,
    ) -> OverlayResult<Box<dyn RenderSurface>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SolidSurface {
            width,
            height,
            renders: self.renders.clone(),
            heap_exhausted: self.heap_exhausted,
        }))
    }
}

#[derive(Default)]
struct RecordingUpload {
    handed_off: Mutex<Vec<(Uuid, PathBuf)>>,
}

#[async_trait::async_trait]
impl UploadSink for RecordingUpload {
    async fn enqueue_for_upload(
        &self,
        part_id: Uuid,
        output_path: &Path,
    ) -> Result<(), UploadError> {
        self.handed_off
            .lock()
            .unwrap()
            .push((part_id, output_path.to_path_buf()));
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<MemoryCaptureStore>,
    queue: PostProcessQueue,
    surfaces: Arc<SolidProvider>,
    upload: Arc<RecordingUpload>,
    processor: Arc<PostProcessor>,
    session: BroadcastSession,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn fixture() -> Fixture {
    fixture_with(SolidProvider::default())
}

fn fixture_with(surfaces: SolidProvider) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = VodloaderConfig::default();
    config.paths.ffprobe = script(dir.path(), "ffprobe", FFPROBE);
    config.paths.ffmpeg = script(dir.path(), "ffmpeg", FFMPEG);
    config.ad_detection.enabled = false;

    let store = Arc::new(MemoryCaptureStore::new());
    let mut channel = Channel::new("42", "somechannel");
    channel.overlay.position = Some("bottom-right".into());
    store.save_channel(&channel).unwrap();
    let session = BroadcastSession {
        id: Uuid::new_v4(),
        channel_id: "42".into(),
        platform_stream_id: None,
        title: Some("stream".into()),
        category: None,
        started_at: t0(),
        ended_at: None,
    };
    store.create_session(&session).unwrap();

    let queue_store = QueueStore::new(dir.path().join("queue.sqlite")).unwrap();
    queue_store.initialize().unwrap();
    let queue = PostProcessQueue::new(queue_store);
    let surfaces = Arc::new(surfaces);
    let upload = Arc::new(RecordingUpload::default());
    let processor = Arc::new(PostProcessor::new(
        &config,
        store.clone(),
        queue.clone(),
        surfaces.clone(),
        upload.clone(),
    ));
    Fixture {
        dir,
        store,
        queue,
        surfaces,
        upload,
        processor,
        session,
    }
}

impl Fixture {
    /// Stores an ended two-second part; the capture file is written when
    /// `with_file` is set.
    fn part(&self, number: u32, with_file: bool) -> RecordedPart {
        let started_at = t0() + chrono::Duration::seconds(i64::from(number) * 10);
        let path = self
            .dir
            .path()
            .join(format!("{}.part{number:02}.ts", self.session.id));
        if with_file {
            std::fs::write(&path, b"capture").unwrap();
        }
        let mut part = RecordedPart {
            id: Uuid::new_v4(),
            session_id: self.session.id,
            channel_id: "42".into(),
            part_number: number,
            quality: "best".into(),
            path,
            started_at,
            ended_at: None,
            output_path: None,
        };
        self.store.create_part(&part).unwrap();
        let ended_at = started_at + chrono::Duration::seconds(2);
        self.store.end_part(part.id, ended_at).unwrap();
        part.ended_at = Some(ended_at);
        part
    }

    fn chat(&self, id: &str, at: DateTime<Utc>) {
        self.store
            .save_chat_message(&ChatMessage {
                id: id.into(),
                channel_id: "42".into(),
                author: "viewer".into(),
                text: format!("message {id}"),
                color: Some("#00ff00".into()),
                badges: Vec::new(),
                moderator: false,
                subscriber: false,
                first_message: false,
                timestamp: at,
            })
            .unwrap();
    }
}

#[tokio::test]
async fn part_without_chat_is_remuxed_and_handed_off() {
    let fx = fixture();
    let part = fx.part(1, true);
    fx.queue.enqueue_part(&part).unwrap();
    let entry = fx.queue.claim_next().unwrap().unwrap();

    let outcome = fx
        .processor
        .process(&entry, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.kind, ProcessKind::Remuxed);
    assert_eq!(outcome.output, part.path.with_extension("mp4"));
    assert_eq!(std::fs::read(&outcome.output).unwrap(), b"x");
    assert!(!part.path.exists());
    assert_eq!(
        fx.store.get_part(part.id).unwrap().unwrap().output_path,
        Some(outcome.output.clone())
    );
    assert_eq!(fx.surfaces.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn part_with_chat_is_composited() {
    let fx = fixture();
    let part = fx.part(1, true);
    fx.chat("a", part.started_at + chrono::Duration::milliseconds(500));
    fx.chat("b", part.started_at + chrono::Duration::milliseconds(1_200));
    fx.chat("late", part.started_at + chrono::Duration::seconds(30));
    fx.queue.enqueue_part(&part).unwrap();
    let entry = fx.queue.claim_next().unwrap().unwrap();

    fx.processor.handle(&entry, &CancellationToken::new()).await;

    let done = fx.queue.store().get(entry.id).unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Done);
    let output = done.output_path.expect("output recorded");
    let bytes = std::fs::read(&output).unwrap();
    assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    assert_eq!(bytes.last(), Some(&b'x'));
    assert!(!part.path.exists());
    assert!(fx.surfaces.opened.load(Ordering::SeqCst) >= 1);
    assert!(fx.surfaces.renders.load(Ordering::SeqCst) >= 1);

    let handed_off = fx.upload.handed_off.lock().unwrap().clone();
    assert_eq!(handed_off, vec![(part.id, output)]);
}

#[tokio::test]
async fn composited_outcome_counts_frames_and_messages() {
    let fx = fixture();
    let part = fx.part(1, true);
    fx.chat("a", part.started_at + chrono::Duration::milliseconds(500));
    fx.queue.enqueue_part(&part).unwrap();
    let entry = fx.queue.claim_next().unwrap().unwrap();

    let outcome = fx
        .processor
        .process(&entry, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome.kind,
        ProcessKind::Composited {
            messages: 1,
            frames: 20,
            failed_frames: 0,
            ad_seconds_removed: 0.0,
        }
    );

    let again = fx
        .processor
        .process(&entry, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.kind, ProcessKind::AlreadyProcessed);
    assert_eq!(again.output, outcome.output);
}

#[tokio::test]
async fn exhausted_render_memory_fails_the_job_for_good() {
    let fx = fixture_with(SolidProvider {
        heap_exhausted: true,
        ..SolidProvider::default()
    });
    let part = fx.part(1, true);
    fx.chat("a", part.started_at + chrono::Duration::milliseconds(500));
    fx.queue.enqueue_part(&part).unwrap();
    let entry = fx.queue.claim_next().unwrap().unwrap();

    fx.processor.handle(&entry, &CancellationToken::new()).await;

    let failed = fx.queue.store().get(entry.id).unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert!(!failed.retryable);
    assert!(failed
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("exceeds limit"));
    // rendering stopped at the first frame
    assert_eq!(fx.surfaces.renders.load(Ordering::SeqCst), 1);

    assert!(part.path.exists());
    assert!(fx.store.get_part(part.id).unwrap().unwrap().output_path.is_none());
    assert!(fx.upload.handed_off.lock().unwrap().is_empty());
    assert_eq!(fx.queue.store().recover().unwrap(), 0);
}

#[tokio::test]
async fn failing_part_does_not_block_the_next_one() {
    let fx = fixture();
    let missing = fx.part(1, false);
    let healthy = fx.part(2, true);
    fx.queue.enqueue_part(&missing).unwrap();
    fx.queue.enqueue_part(&healthy).unwrap();

    let workers = PostProcessWorkers::spawn(fx.processor.clone(), 1, Duration::from_millis(20));
    let mut settled = false;
    for _ in 0..300 {
        let summary = fx.queue.store().summary().unwrap();
        if summary.count(QueueStatus::Done) == 1 && summary.count(QueueStatus::Failed) == 1 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    workers.shutdown().await;
    assert!(settled, "queue did not settle");

    let entries = fx.queue.store().list(&Default::default()).unwrap();
    let failed = entries.iter().find(|e| e.part_id == missing.id).unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert!(!failed.retryable);
    assert!(failed
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("capture file missing"));
    let done = entries.iter().find(|e| e.part_id == healthy.id).unwrap();
    assert_eq!(done.status, QueueStatus::Done);
    assert!(fx.store.get_part(healthy.id).unwrap().unwrap().output_path.is_some());
    assert!(fx.store.get_part(missing.id).unwrap().unwrap().output_path.is_none());
}

#[tokio::test]
async fn startup_recovery_queues_unprocessed_parts() {
    let fx = fixture();
    let queued = fx.part(1, true);
    let orphan = fx.part(2, true);
    fx.queue.enqueue_part(&queued).unwrap();
    let interrupted = fx.queue.claim_next().unwrap().unwrap();
    assert_eq!(interrupted.part_id, queued.id);

    let report = recover_pending(fx.store.as_ref(), &fx.queue).unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.enqueued, 1);
    let summary = fx.queue.store().summary().unwrap();
    assert_eq!(summary.count(QueueStatus::Queued), 2);
    let entries = fx.queue.store().list(&Default::default()).unwrap();
    assert!(entries.iter().any(|e| e.part_id == orphan.id));
}
