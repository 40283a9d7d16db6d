use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fetcher::{Chunk, ChunkReader, FetchResult};
use crate::models::{BroadcastSession, Channel, RecordedPart};
use crate::platform::{LiveStreamInfo, Quality};

use super::{
    AbortReason, CaptureContext, CaptureError, CaptureReport, CaptureResult, CaptureState,
    PartSummary,
};

/// Owns the life cycle of one broadcast of one channel.
pub struct CaptureSession {
    ctx: Arc<CaptureContext>,
    channel: Channel,
    quality_override: Option<String>,
    state: watch::Sender<CaptureState>,
    cancel: CancellationToken,
}

/// Running session: observe its state, stop it, wait for its report.
#[derive(Debug)]
pub struct CaptureHandle {
    channel_id: String,
    state: watch::Receiver<CaptureState>,
    cancel: CancellationToken,
    task: JoinHandle<CaptureResult<CaptureReport>>,
}

impl CaptureHandle {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.clone()
    }

    /// Requests a stop; the in-progress part is still finalized and queued.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the session when cancelled; outlives [`Self::join`].
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> CaptureResult<CaptureReport> {
        self.task
            .await
            .map_err(|err| CaptureError::Task(err.to_string()))?
    }
}

/// Part currently being written. Exclusively owned by the session until it
/// is finalized and handed to the queue.
struct OpenPart {
    part: RecordedPart,
    writer: BufWriter<File>,
    bytes: u64,
    opened: Instant,
    media_elapsed: Option<Duration>,
}

impl OpenPart {
    fn elapsed(&self) -> Duration {
        self.media_elapsed.unwrap_or_else(|| self.opened.elapsed())
    }

    async fn write(&mut self, chunk: &Chunk) -> std::io::Result<()> {
        self.writer.write_all(&chunk.data).await?;
        self.bytes += chunk.data.len() as u64;
        if let Some(duration) = chunk.media_duration {
            self.media_elapsed = Some(self.media_elapsed.unwrap_or_default() + duration);
        }
        Ok(())
    }
}

enum ReadOutcome {
    Cancelled,
    Read(FetchResult<Option<Chunk>>),
}

enum LoopExit {
    Ended,
    Aborted(AbortReason),
    Failed(CaptureError),
}

impl CaptureSession {
    pub fn new(ctx: Arc<CaptureContext>, channel: Channel, quality_override: Option<String>) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            ctx,
            channel,
            quality_override,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the session on the runtime and returns its handle.
    pub fn start(
        ctx: Arc<CaptureContext>,
        channel: Channel,
        quality_override: Option<String>,
    ) -> CaptureHandle {
        let session = Self::new(ctx, channel, quality_override);
        let handle_state = session.state.subscribe();
        let cancel = session.cancel.clone();
        let channel_id = session.channel.id.clone();
        let task = tokio::spawn(session.run());
        CaptureHandle {
            channel_id,
            state: handle_state,
            cancel,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    fn transition(&self, next: CaptureState) -> CaptureResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(CaptureError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_replace(next);
        Ok(())
    }

    fn abort(&self) {
        if !self.state().is_terminal() {
            self.state.send_replace(CaptureState::Aborted);
        }
    }

    fn report(&self, session_id: Option<Uuid>, parts: Vec<PartSummary>, reason: Option<AbortReason>) -> CaptureReport {
        CaptureReport {
            channel_id: self.channel.id.clone(),
            session_id,
            final_state: self.state(),
            abort_reason: reason,
            parts,
        }
    }

    pub async fn run(self) -> CaptureResult<CaptureReport> {
        self.transition(CaptureState::Opening)?;
        let requested = self
            .quality_override
            .clone()
            .or_else(|| self.channel.quality.clone())
            .unwrap_or_else(|| self.ctx.settings.default_quality.clone());
        let quality: Quality = match requested.parse() {
            Ok(quality) => quality,
            Err(err) => {
                self.abort();
                return Err(CaptureError::Platform(err));
            }
        };

        let info = match self.fetch_stream_info().await {
            Ok(Some(info)) => info,
            Ok(None) => {
                self.abort();
                info!(channel = %self.channel.login, "capture cancelled while opening");
                return Ok(self.report(None, Vec::new(), Some(AbortReason::Cancelled)));
            }
            Err(err) => {
                self.persist_unavailable();
                self.abort();
                return Err(err);
            }
        };

        let now = Utc::now();
        let session = BroadcastSession {
            id: Uuid::new_v4(),
            channel_id: self.channel.id.clone(),
            platform_stream_id: info.platform_stream_id,
            title: info.title,
            category: info.category,
            started_at: info.started_at.min(now),
            ended_at: None,
        };
        if let Err(err) = self.ctx.store.create_session(&session) {
            self.abort();
            return Err(err.into());
        }
        info!(
            channel = %self.channel.login,
            session_id = %session.id,
            title = session.title.as_deref().unwrap_or(""),
            %quality,
            "broadcast session started"
        );
        self.transition(CaptureState::Recording)?;

        let reader = match self.open_reader(&quality).await {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                self.end_session(&session, Utc::now());
                self.abort();
                return Ok(self.report(Some(session.id), Vec::new(), Some(AbortReason::Cancelled)));
            }
            Err(err) => {
                self.end_session(&session, Utc::now());
                self.abort();
                return Err(err);
            }
        };

        self.record(&session, reader, &quality).await
    }

    /// Queries the platform until it reports the stream, backing off between
    /// attempts. `Ok(None)` means the session was cancelled meanwhile.
    async fn fetch_stream_info(&self) -> CaptureResult<Option<LiveStreamInfo>> {
        let policy = self.ctx.settings.metadata_retry;
        let attempts = policy.attempts.max(1);
        for attempt in 0..attempts {
            match self.ctx.platform.current_stream(&self.channel).await {
                Ok(Some(info)) => return Ok(Some(info)),
                Ok(None) => {
                    warn!(channel = %self.channel.login, attempt = attempt + 1, "stream not reported live yet")
                }
                Err(err) => {
                    warn!(channel = %self.channel.login, attempt = attempt + 1, error = %err, "stream info request failed")
                }
            }
            if attempt + 1 < attempts {
                let delay = policy.delay_for(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = sleep(delay) => {}
                }
            }
        }
        error!(channel = %self.channel.login, attempts, "giving up on stream info");
        Err(CaptureError::StreamUnretrievable {
            channel: self.channel.login.clone(),
            attempts,
        })
    }

    /// Records the failed attempt as an empty, already-ended session.
    fn persist_unavailable(&self) {
        let now = Utc::now();
        let session = BroadcastSession {
            id: Uuid::new_v4(),
            channel_id: self.channel.id.clone(),
            platform_stream_id: None,
            title: None,
            category: None,
            started_at: now,
            ended_at: Some(now),
        };
        if let Err(err) = self.ctx.store.create_session(&session) {
            warn!(channel = %self.channel.login, error = %err, "failed to persist unavailable session");
        }
    }

    async fn open_reader(&self, quality: &Quality) -> CaptureResult<Option<Box<dyn ChunkReader>>> {
        let attempts = self.ctx.settings.read_retry_attempts + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                opened = self.ctx.fetcher.open(&self.channel, quality) => opened,
            };
            match opened {
                Ok(reader) => return Ok(Some(reader)),
                Err(err) if attempt >= attempts => return Err(err.into()),
                Err(err) => {
                    warn!(channel = %self.channel.login, attempt, error = %err, "failed to open stream; retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = sleep(self.ctx.settings.read_retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn record(
        &self,
        session: &BroadcastSession,
        mut reader: Box<dyn ChunkReader>,
        quality: &Quality,
    ) -> CaptureResult<CaptureReport> {
        let settings = &self.ctx.settings;
        let mut current: Option<OpenPart> = None;
        let mut parts: Vec<PartSummary> = Vec::new();
        let mut next_start = Utc::now();
        let mut failures = 0u32;

        let exit = loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ReadOutcome::Cancelled,
                read = reader.next_chunk() => ReadOutcome::Read(read),
            };
            match outcome {
                ReadOutcome::Cancelled => {
                    info!(channel = %self.channel.login, session_id = %session.id, "stop requested");
                    break LoopExit::Aborted(AbortReason::Cancelled);
                }
                ReadOutcome::Read(Ok(Some(chunk))) => {
                    failures = 0;
                    if current.is_none() {
                        let number = parts.len() as u32 + 1;
                        match self.open_part(session, number, next_start, quality).await {
                            Ok(open) => current = Some(open),
                            Err(err) => break LoopExit::Failed(err),
                        }
                    }
                    let Some(open) = current.as_mut() else {
                        continue;
                    };
                    if let Err(err) = open.write(&chunk).await {
                        error!(path = %open.part.path.display(), error = %err, "failed to write chunk");
                        break LoopExit::Aborted(AbortReason::WriteFailed {
                            error: err.to_string(),
                        });
                    }
                    if open.elapsed() >= settings.cutoff {
                        match self.roll_over(open).await {
                            Ok((summary, ended_at)) => {
                                current = None;
                                next_start = ended_at;
                                parts.push(summary);
                            }
                            Err(err) => break LoopExit::Failed(err),
                        }
                    }
                }
                ReadOutcome::Read(Ok(None)) => {
                    info!(channel = %self.channel.login, session_id = %session.id, "upstream ended");
                    break LoopExit::Ended;
                }
                ReadOutcome::Read(Err(err)) => {
                    failures += 1;
                    if failures > settings.read_retry_attempts {
                        error!(channel = %self.channel.login, attempts = failures, error = %err, "read retries exhausted");
                        break LoopExit::Aborted(AbortReason::ReadRetriesExhausted {
                            attempts: failures,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(channel = %self.channel.login, attempt = failures, error = %err, "chunk read failed; retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break LoopExit::Aborted(AbortReason::Cancelled),
                        _ = sleep(settings.read_retry_delay) => {}
                    }
                }
            }
        };

        let (abort_reason, mut failure) = match exit {
            LoopExit::Ended => (None, None),
            LoopExit::Aborted(reason) => (Some(reason), None),
            LoopExit::Failed(err) => (None, Some(err)),
        };
        if abort_reason.is_none() && failure.is_none() {
            if let Err(err) = self.finish(session, &mut current, &mut parts).await {
                failure = Some(err);
            }
        }

        if abort_reason.is_some() || failure.is_some() {
            let mut session_end = Utc::now();
            if let Some(mut open) = current.take() {
                let pending = open.part.clone();
                let bytes = open.bytes;
                let elapsed = open.elapsed();
                match timeout(settings.stop_grace, self.finalize_part(&mut open)).await {
                    Ok(Ok((summary, ended_at))) => {
                        session_end = session_end.max(ended_at);
                        parts.push(summary);
                    }
                    Ok(Err(err)) => {
                        error!(part_id = %pending.id, error = %err, "failed to finalize part on abort");
                        parts.push(unfinalized(&pending, bytes, elapsed));
                    }
                    Err(_) => {
                        warn!(part_id = %pending.id, grace = ?settings.stop_grace, "part finalization exceeded stop grace");
                        parts.push(unfinalized(&pending, bytes, elapsed));
                    }
                }
            }
            self.end_session(session, session_end);
            self.abort();
            match &failure {
                Some(err) => error!(channel = %self.channel.login, session_id = %session.id, error = %err, "capture failed"),
                None => warn!(channel = %self.channel.login, session_id = %session.id, reason = ?abort_reason, "capture aborted"),
            }
        }
        // the connection is released only once the last part is on disk
        drop(reader);

        match failure {
            Some(err) => Err(err),
            None => Ok(self.report(Some(session.id), parts, abort_reason)),
        }
    }

    async fn roll_over(&self, open: &mut OpenPart) -> CaptureResult<(PartSummary, DateTime<Utc>)> {
        self.transition(CaptureState::RollingOver)?;
        let finalized = self.finalize_part(open).await?;
        self.transition(CaptureState::Recording)?;
        Ok(finalized)
    }

    /// Clean end of stream: last part finalized, session closed, state Ended.
    /// On error the unfinished part is left in `current` for the abort path.
    async fn finish(
        &self,
        session: &BroadcastSession,
        current: &mut Option<OpenPart>,
        parts: &mut Vec<PartSummary>,
    ) -> CaptureResult<()> {
        self.transition(CaptureState::Finalizing)?;
        let mut session_end = Utc::now();
        if let Some(open) = current.as_mut() {
            let (summary, ended_at) = self.finalize_part(open).await?;
            *current = None;
            session_end = session_end.max(ended_at);
            parts.push(summary);
        }
        self.end_session(session, session_end);
        self.transition(CaptureState::Ended)
    }

    async fn open_part(
        &self,
        session: &BroadcastSession,
        number: u32,
        started_at: DateTime<Utc>,
        quality: &Quality,
    ) -> CaptureResult<OpenPart> {
        let dir = self.ctx.settings.download_dir.join(&self.channel.login);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| CaptureError::Io {
                source,
                path: dir.clone(),
            })?;
        let path: PathBuf = dir.join(format!("{}.part{:02}.ts", session.id, number));
        let file = File::create(&path)
            .await
            .map_err(|source| CaptureError::Io {
                source,
                path: path.clone(),
            })?;
        let part = RecordedPart {
            id: Uuid::new_v4(),
            session_id: session.id,
            channel_id: self.channel.id.clone(),
            part_number: number,
            quality: quality.to_string(),
            path,
            started_at,
            ended_at: None,
            output_path: None,
        };
        self.ctx.store.create_part(&part)?;
        info!(part_id = %part.id, part_number = number, path = %part.path.display(), "recording part");
        Ok(OpenPart {
            part,
            writer: BufWriter::new(file),
            bytes: 0,
            opened: Instant::now(),
            media_elapsed: None,
        })
    }

    /// Flushes the file, sets the part's end exactly once and hands the part
    /// to the post-process queue. A part that already has its end is only
    /// summarized again, so a failed attempt can be retried.
    async fn finalize_part(&self, open: &mut OpenPart) -> CaptureResult<(PartSummary, DateTime<Utc>)> {
        let elapsed = open.elapsed();
        let ended_at = match open.part.ended_at {
            Some(ended_at) => ended_at,
            None => {
                let path = open.part.path.clone();
                let io_err = |source| CaptureError::Io {
                    source,
                    path: path.clone(),
                };
                open.writer.flush().await.map_err(io_err)?;
                open.writer.get_ref().sync_all().await.map_err(io_err)?;

                let ended_at = open.part.started_at
                    + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
                self.ctx.store.end_part(open.part.id, ended_at)?;
                open.part.ended_at = Some(ended_at);

                if let Err(err) = self.ctx.queue.enqueue_part(&open.part) {
                    error!(part_id = %open.part.id, error = %err, "failed to enqueue part; left for startup recovery");
                }
                info!(
                    part_id = %open.part.id,
                    part_number = open.part.part_number,
                    bytes = open.bytes,
                    elapsed = ?elapsed,
                    "part finalized"
                );
                ended_at
            }
        };
        Ok((
            PartSummary {
                part_id: open.part.id,
                part_number: open.part.part_number,
                path: open.part.path.clone(),
                bytes: open.bytes,
                elapsed,
                finalized: true,
            },
            ended_at,
        ))
    }

    fn end_session(&self, session: &BroadcastSession, ended_at: DateTime<Utc>) {
        let ended_at = ended_at.max(session.started_at);
        match self.ctx.store.end_session(session.id, ended_at) {
            Ok(()) => info!(session_id = %session.id, "broadcast session ended"),
            Err(err) => error!(session_id = %session.id, error = %err, "failed to end session"),
        }
    }
}

fn unfinalized(part: &RecordedPart, bytes: u64, elapsed: Duration) -> PartSummary {
    PartSummary {
        part_id: part.id,
        part_number: part.part_number,
        path: part.path.clone(),
        bytes,
        elapsed,
        finalized: false,
    }
}
