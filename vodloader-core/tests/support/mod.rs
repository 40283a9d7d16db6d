#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use vodloader_core::capture::{Backoff, CaptureContext, CaptureSettings};
use vodloader_core::fetcher::{Chunk, ChunkReader, FetchError, FetchResult, StreamFetcher};
use vodloader_core::models::{
    BroadcastSession, Category, Channel, ChatMessage, MetadataUpdate, RecordedPart,
};
use vodloader_core::platform::{LiveStreamInfo, PlatformClient, PlatformError, Quality};
use vodloader_core::queue::{PostProcessQueue, QueueStore};
use vodloader_core::store::{
    CaptureStore, ChannelFilter, MemoryCaptureStore, PartFilter, SessionFilter, StoreError,
    StoreResult,
};

pub const CHUNK_LEN: usize = 64;

pub fn chunk_bytes(index: usize) -> Vec<u8> {
    (0..CHUNK_LEN)
        .map(|offset| (index.wrapping_mul(31) + offset) as u8)
        .collect()
}

/// Describes the stream a [`ScriptedFetcher`] serves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// `None` streams forever.
    pub chunks: Option<usize>,
    /// Tag every chunk with one second of media.
    pub one_second_chunks: bool,
    pub delay: Option<Duration>,
    /// Chunk index -> number of failed reads before it is delivered.
    pub failures_before: HashMap<usize, u32>,
    /// Every read fails once this many chunks were delivered.
    pub fail_forever_after: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedFetcher {
    script: Script,
    emitted: Arc<Mutex<Vec<u8>>>,
    opens: Arc<AtomicU32>,
    released: Arc<AtomicBool>,
}

impl ScriptedFetcher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn emitted(&self) -> Vec<u8> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Set once the last opened reader has been dropped.
    pub fn released(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

struct ScriptedReader {
    script: Script,
    index: usize,
    failed: HashMap<usize, u32>,
    emitted: Arc<Mutex<Vec<u8>>>,
    released: Arc<AtomicBool>,
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ChunkReader for ScriptedReader {
    async fn next_chunk(&mut self) -> FetchResult<Option<Chunk>> {
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.chunks.map_or(false, |total| self.index >= total) {
            return Ok(None);
        }
        if self
            .script
            .fail_forever_after
            .map_or(false, |limit| self.index >= limit)
        {
            return Err(FetchError::Upstream("connection reset".into()));
        }
        let wanted = self.script.failures_before.get(&self.index).copied().unwrap_or(0);
        let failed = self.failed.entry(self.index).or_insert(0);
        if *failed < wanted {
            *failed += 1;
            return Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "segment fetch failed",
            )));
        }

        let data = chunk_bytes(self.index);
        self.emitted.lock().unwrap().extend_from_slice(&data);
        self.index += 1;
        Ok(Some(Chunk {
            data,
            media_duration: self
                .script
                .one_second_chunks
                .then(|| Duration::from_secs(1)),
        }))
    }
}

#[async_trait::async_trait]
impl StreamFetcher for ScriptedFetcher {
    async fn open(
        &self,
        _channel: &Channel,
        _quality: &Quality,
    ) -> FetchResult<Box<dyn ChunkReader>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader {
            script: self.script.clone(),
            index: 0,
            failed: HashMap::new(),
            emitted: Arc::clone(&self.emitted),
            released: Arc::clone(&self.released),
        }))
    }
}

/// Reports the stream as live after `failures` failed requests. `u32::MAX`
/// never succeeds.
#[derive(Debug, Default)]
pub struct FakePlatform {
    failures: u32,
    calls: AtomicU32,
}

impl FakePlatform {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PlatformClient for FakePlatform {
    async fn current_stream(
        &self,
        channel: &Channel,
    ) -> Result<Option<LiveStreamInfo>, PlatformError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(PlatformError::Request("503 service unavailable".into()));
        }
        Ok(Some(LiveStreamInfo {
            platform_stream_id: Some(format!("{}-stream", channel.id)),
            title: Some("morning stream".into()),
            category: Some(Category {
                id: Some("509658".into()),
                name: "Just Chatting".into(),
            }),
            started_at: Utc::now(),
        }))
    }
}

pub fn open_queue(dir: &Path) -> PostProcessQueue {
    let store = QueueStore::new(dir.join("queue.sqlite")).expect("create queue");
    store.initialize().expect("initialize queue");
    PostProcessQueue::new(store)
}

pub fn settings(download_dir: PathBuf, cutoff: Duration) -> CaptureSettings {
    CaptureSettings {
        download_dir,
        default_quality: "best".into(),
        cutoff,
        metadata_retry: Backoff {
            attempts: 3,
            base: Duration::from_millis(500),
            max: Duration::from_secs(2),
        },
        read_retry_attempts: 2,
        read_retry_delay: Duration::from_millis(10),
        stop_grace: Duration::from_secs(5),
    }
}

pub fn context(
    dir: &Path,
    store: Arc<dyn CaptureStore>,
    platform: Arc<dyn PlatformClient>,
    fetcher: Arc<dyn StreamFetcher>,
    cutoff: Duration,
) -> Arc<CaptureContext> {
    Arc::new(CaptureContext {
        store,
        platform,
        fetcher,
        queue: open_queue(dir),
        settings: settings(dir.join("downloads"), cutoff),
    })
}

/// Reads every part file in order and concatenates the bytes.
pub fn concat_files(paths: &[PathBuf]) -> Vec<u8> {
    paths
        .iter()
        .flat_map(|path| std::fs::read(path).expect("read part file"))
        .collect()
}

/// In-memory store whose first `failing_end_parts` calls to `end_part` fail
/// with an I/O error. When watching a reader, it also counts parts ended
/// after that reader was released.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryCaptureStore,
    failing_end_parts: AtomicU32,
    end_part_calls: AtomicU32,
    reader_released: Option<Arc<AtomicBool>>,
    ended_after_release: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: MemoryCaptureStore, failing_end_parts: u32) -> Self {
        Self {
            inner,
            failing_end_parts: AtomicU32::new(failing_end_parts),
            end_part_calls: AtomicU32::new(0),
            reader_released: None,
            ended_after_release: AtomicU32::new(0),
        }
    }

    pub fn watching(mut self, reader_released: Arc<AtomicBool>) -> Self {
        self.reader_released = Some(reader_released);
        self
    }

    pub fn end_part_calls(&self) -> u32 {
        self.end_part_calls.load(Ordering::SeqCst)
    }

    pub fn ended_after_release(&self) -> u32 {
        self.ended_after_release.load(Ordering::SeqCst)
    }
}

impl CaptureStore for FlakyStore {
    fn get_channel(&self, id: &str) -> StoreResult<Option<Channel>> {
        self.inner.get_channel(id)
    }

    fn list_channels(&self, filter: &ChannelFilter) -> StoreResult<Vec<Channel>> {
        self.inner.list_channels(filter)
    }

    fn save_channel(&self, channel: &Channel) -> StoreResult<()> {
        self.inner.save_channel(channel)
    }

    fn delete_channel(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete_channel(id)
    }

    fn create_session(&self, session: &BroadcastSession) -> StoreResult<()> {
        self.inner.create_session(session)
    }

    fn get_session(&self, id: Uuid) -> StoreResult<Option<BroadcastSession>> {
        self.inner.get_session(id)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<BroadcastSession>> {
        self.inner.list_sessions(filter)
    }

    fn update_session_metadata(
        &self,
        id: Uuid,
        title: Option<&str>,
        category: Option<&Category>,
    ) -> StoreResult<()> {
        self.inner.update_session_metadata(id, title, category)
    }

    fn end_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.end_session(id, ended_at)
    }

    fn record_metadata_update(&self, update: &MetadataUpdate) -> StoreResult<()> {
        self.inner.record_metadata_update(update)
    }

    fn create_part(&self, part: &RecordedPart) -> StoreResult<()> {
        self.inner.create_part(part)
    }

    fn get_part(&self, id: Uuid) -> StoreResult<Option<RecordedPart>> {
        self.inner.get_part(id)
    }

    fn list_parts(&self, filter: &PartFilter) -> StoreResult<Vec<RecordedPart>> {
        self.inner.list_parts(filter)
    }

    fn end_part(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        self.end_part_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(released) = &self.reader_released {
            if released.load(Ordering::SeqCst) {
                self.ended_after_release.fetch_add(1, Ordering::SeqCst);
            }
        }
        let remaining = self.failing_end_parts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_end_parts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk hiccup",
            )));
        }
        self.inner.end_part(id, ended_at)
    }

    fn set_part_output(&self, id: Uuid, output: &Path) -> StoreResult<()> {
        self.inner.set_part_output(id, output)
    }

    fn delete_part(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete_part(id)
    }

    fn save_chat_message(&self, message: &ChatMessage) -> StoreResult<bool> {
        self.inner.save_chat_message(message)
    }

    fn chat_messages_between(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ChatMessage>> {
        self.inner.chat_messages_between(channel_id, start, end)
    }
}
