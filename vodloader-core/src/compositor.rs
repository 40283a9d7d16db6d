//! Single-pass composition of a recording with its overlay frames. Frames are
//! streamed into the encoder's stdin as they are produced; nothing is staged
//! on disk.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EncoderSection;
use crate::error::{Classify, FailureClass};
use crate::overlay::{OverlayError, OverlayResult};
use crate::process::{describe, tail_lossy, terminate};

const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// One transparent overlay raster at a video timestamp.
#[derive(Debug, Clone)]
pub struct OverlayFrame {
    pub index: u64,
    pub timestamp: f64,
    pub png: Arc<Vec<u8>>,
}

/// Forward-only producer of overlay frames, pulled by the compositor.
#[async_trait::async_trait]
pub trait FrameSource: Send {
    fn total_frames(&self) -> u64;
    fn frame_rate(&self) -> f64;
    /// `Ok(None)` once the sequence is exhausted.
    async fn next_frame(&mut self) -> OverlayResult<Option<OverlayFrame>>;
    /// Releases whatever produces the frames. Safe to call more than once.
    async fn close(&mut self);
}

/// Frame source without frames. Composing with it is a plain remux.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverlay;

#[async_trait::async_trait]
impl FrameSource for NoOverlay {
    fn total_frames(&self) -> u64 {
        0
    }

    fn frame_rate(&self) -> f64 {
        0.0
    }

    async fn next_frame(&mut self) -> OverlayResult<Option<OverlayFrame>> {
        Ok(None)
    }

    async fn close(&mut self) {}
}

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("encoder exited with status {status:?}: {stderr}")]
    EncoderFailed { status: Option<i32>, stderr: String },
    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),
    #[error("composition cancelled")]
    Cancelled,
    #[error("composition timed out after {0:?}")]
    Timeout(Duration),
    #[error("overlay frame {index} arrived after frame {previous}")]
    FrameOrder { previous: u64, index: u64 },
    #[error("failed writing to encoder: {0}")]
    Pipe(std::io::Error),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CompositorError {
    fn class(&self) -> FailureClass {
        match self {
            CompositorError::Timeout(_) => FailureClass::ResourceExceeded,
            CompositorError::Overlay(err) => err.class(),
            CompositorError::Spawn { .. } => FailureClass::Internal,
            _ => FailureClass::CompositionFailure,
        }
    }
}

pub type CompositorResult<T> = Result<T, CompositorError>;

/// Where and what to compose.
#[derive(Debug, Clone)]
pub struct ComposeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub overlay_x: u32,
    pub overlay_y: u32,
    /// Media length of `input`; scales the encoder timeout.
    pub duration_seconds: f64,
}

enum Outcome {
    Finished(CompositorResult<(u64, ExitStatus)>),
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct StreamingCompositor {
    ffmpeg: PathBuf,
    encoder: EncoderSection,
}

impl StreamingCompositor {
    pub fn new(ffmpeg: impl Into<PathBuf>, encoder: EncoderSection) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            encoder,
        }
    }

    /// Encoder invocation for `job`. With no overlay frames the input is
    /// stream-copied untouched.
    pub fn command(&self, job: &ComposeJob, total_frames: u64, frame_rate: f64) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.arg("-hide_banner").arg("-y");
        if total_frames == 0 {
            command
                .arg("-nostdin")
                .arg("-i")
                .arg(&job.input)
                .arg("-map")
                .arg("0:v")
                .arg("-map")
                .arg("0:a?")
                .arg("-c")
                .arg("copy")
                .arg(&job.output);
            return command;
        }
        command
            .arg("-i")
            .arg(&job.input)
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg("png")
            .arg("-framerate")
            .arg(format_rate(frame_rate))
            .arg("-i")
            .arg("-")
            .arg("-filter_complex")
            .arg(format!(
                "[0:v][1:v]overlay={}:{}:eof_action=pass[outv]",
                job.overlay_x, job.overlay_y
            ))
            .arg("-map")
            .arg("[outv]")
            .arg("-map")
            .arg("0:a?")
            .arg("-c:v")
            .arg(&self.encoder.video_codec)
            .arg("-preset")
            .arg(&self.encoder.preset)
            .arg("-crf")
            .arg(self.encoder.crf.to_string())
            .arg("-pix_fmt")
            .arg(&self.encoder.pix_fmt)
            .arg("-c:a")
            .arg("copy")
            .arg(&job.output);
        command
    }

    /// Runs the encoder over `job.input` and the frames of `frames`.
    ///
    /// On cancellation or timeout the encoder is terminated and the partial
    /// output removed. `frames` is always closed before returning.
    pub async fn compose(
        &self,
        job: &ComposeJob,
        frames: &mut dyn FrameSource,
        cancel: &CancellationToken,
    ) -> CompositorResult<PathBuf> {
        let total = frames.total_frames();
        let fps = frames.frame_rate();
        let mut command = self.command(job, total, fps);
        command
            .stdin(if total > 0 { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let program = describe(&command);
        debug!(command = %program, "starting encoder");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                frames.close().await;
                return Err(CompositorError::Spawn { program, source });
            }
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));
        let stdin = child.stdin.take();

        info!(
            input = %job.input.display(),
            output = %job.output.display(),
            frames = total,
            fps,
            x = job.overlay_x,
            y = job.overlay_y,
            "composition started"
        );
        let started = Instant::now();
        let limit = self.encoder.timeout_for(job.duration_seconds);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = timeout(limit, drive(&mut child, stdin, frames)) => match result {
                Ok(finished) => Outcome::Finished(finished),
                Err(_) => Outcome::TimedOut(limit),
            },
        };
        frames.close().await;

        let status = match outcome {
            Outcome::Finished(Ok((written, status))) => {
                debug!(written, "encoder input complete");
                status
            }
            Outcome::Finished(Err(err)) => {
                self.abandon(&mut child, &job.output).await;
                return Err(err);
            }
            Outcome::Cancelled => {
                warn!(output = %job.output.display(), "composition cancelled; stopping encoder");
                self.abandon(&mut child, &job.output).await;
                return Err(CompositorError::Cancelled);
            }
            Outcome::TimedOut(limit) => {
                warn!(output = %job.output.display(), ?limit, "composition timed out");
                self.abandon(&mut child, &job.output).await;
                return Err(CompositorError::Timeout(limit));
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            remove_partial(&job.output).await;
            return Err(CompositorError::EncoderFailed {
                status: status.code(),
                stderr: tail_lossy(&stderr, STDERR_TAIL_BYTES),
            });
        }
        match tokio::fs::metadata(&job.output).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                remove_partial(&job.output).await;
                return Err(CompositorError::MissingOutput(job.output.clone()));
            }
        }
        info!(
            output = %job.output.display(),
            frames = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "composition finished"
        );
        Ok(job.output.clone())
    }

    async fn abandon(&self, child: &mut Child, output: &Path) {
        if let Err(err) = terminate(child, self.encoder.terminate_grace()).await {
            warn!(error = %err, "failed to terminate encoder");
        }
        remove_partial(output).await;
    }
}

/// Writes every frame to the encoder in order, closes its stdin and waits for
/// it to exit. A closed pipe ends feeding early; the exit status then tells
/// what went wrong.
async fn drive(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    frames: &mut dyn FrameSource,
) -> CompositorResult<(u64, ExitStatus)> {
    let written = match stdin {
        Some(stdin) => feed(stdin, frames).await?,
        None => 0,
    };
    let status = child.wait().await?;
    Ok((written, status))
}

async fn feed(mut stdin: ChildStdin, frames: &mut dyn FrameSource) -> CompositorResult<u64> {
    let mut written = 0u64;
    let mut previous: Option<u64> = None;
    while let Some(frame) = frames.next_frame().await? {
        if let Some(previous) = previous {
            if frame.index <= previous {
                return Err(CompositorError::FrameOrder {
                    previous,
                    index: frame.index,
                });
            }
        }
        previous = Some(frame.index);
        match stdin.write_all(&frame.png).await {
            Ok(()) => written += 1,
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                warn!(frame = frame.index, "encoder closed its input early");
                return Ok(written);
            }
            Err(err) => return Err(CompositorError::Pipe(err)),
        }
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(error = %err, "encoder stdin already closed");
    }
    Ok(written)
}

/// Reads `reader` to the end, keeping only the last `limit` bytes.
async fn read_tail<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                tail.extend_from_slice(&buffer[..read]);
                if tail.len() > limit * 2 {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    if tail.len() > limit {
        tail.drain(..tail.len() - limit);
    }
    tail
}

fn format_rate(fps: f64) -> String {
    if (fps - fps.round()).abs() < 1e-9 {
        format!("{}", fps.round() as u64)
    } else {
        format!("{fps:.3}")
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecFrames {
        frames: Vec<Vec<u8>>,
        next: usize,
        closed: bool,
    }

    impl VecFrames {
        fn new(frames: Vec<Vec<u8>>) -> Self {
            Self {
                frames,
                next: 0,
                closed: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl FrameSource for VecFrames {
        fn total_frames(&self) -> u64 {
            self.frames.len() as u64
        }

        fn frame_rate(&self) -> f64 {
            30.0
        }

        async fn next_frame(&mut self) -> OverlayResult<Option<OverlayFrame>> {
            let Some(png) = self.frames.get(self.next) else {
                return Ok(None);
            };
            let index = self.next as u64;
            self.next += 1;
            Ok(Some(OverlayFrame {
                index,
                timestamp: index as f64 / 30.0,
                png: Arc::new(png.clone()),
            }))
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn job(dir: &Path) -> ComposeJob {
        ComposeJob {
            input: dir.join("part.ts"),
            output: dir.join("part.mp4"),
            overlay_x: 20,
            overlay_y: 40,
            duration_seconds: 1.0,
        }
    }

    #[test]
    fn empty_overlay_is_a_stream_copy() {
        let compositor = StreamingCompositor::new("ffmpeg", EncoderSection::default());
        let command = compositor.command(&job(Path::new("/v")), 0, 30.0);
        assert_eq!(
            describe(&command),
            "ffmpeg -hide_banner -y -nostdin -i /v/part.ts -map 0:v -map 0:a? -c copy /v/part.mp4"
        );
    }

    #[test]
    fn overlay_reads_png_frames_from_stdin() {
        let compositor = StreamingCompositor::new("ffmpeg", EncoderSection::default());
        let line = describe(&compositor.command(&job(Path::new("/v")), 300, 29.97));
        assert!(line.contains("-f image2pipe -vcodec png -framerate 29.970 -i -"));
        assert!(line.contains("[0:v][1:v]overlay=20:40:eof_action=pass[outv]"));
        assert!(line.contains("-map [outv] -map 0:a?"));
        assert!(line.ends_with("/v/part.mp4"));
    }

    #[test]
    fn integral_rates_are_printed_without_decimals() {
        assert_eq!(format_rate(60.0), "60");
        assert_eq!(format_rate(59.94), "59.940");
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let data = vec![b'a'; 100];
        let tail = read_tail(&data[..], 10).await;
        assert_eq!(tail.len(), 10);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_encoder(dir: &Path, body: &str) -> PathBuf {
            let script = dir.join("fake-ffmpeg");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            script
        }

        // Copies stdin into the last argument, then appends a marker byte.
        const CAT_TO_OUTPUT: &str = "for last; do :; done\ncat > \"$last\"\nprintf x >> \"$last\"";

        #[tokio::test]
        async fn frames_are_streamed_in_order() {
            let dir = tempfile::tempdir().unwrap();
            let compositor = StreamingCompositor::new(
                fake_encoder(dir.path(), CAT_TO_OUTPUT),
                EncoderSection::default(),
            );
            let mut frames = VecFrames::new(vec![b"one".to_vec(), b"two".to_vec()]);
            let job = job(dir.path());
            let output = compositor
                .compose(&job, &mut frames, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(std::fs::read(output).unwrap(), b"onetwox");
            assert!(frames.closed);
        }

        #[tokio::test]
        async fn empty_overlay_passes_through() {
            let dir = tempfile::tempdir().unwrap();
            let compositor = StreamingCompositor::new(
                fake_encoder(dir.path(), CAT_TO_OUTPUT),
                EncoderSection::default(),
            );
            let job = job(dir.path());
            compositor
                .compose(&job, &mut NoOverlay, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(std::fs::read(&job.output).unwrap(), b"x");
        }

        #[tokio::test]
        async fn encoder_failure_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let compositor = StreamingCompositor::new(
                fake_encoder(dir.path(), "echo 'invalid filter' >&2\nexit 1"),
                EncoderSection::default(),
            );
            let mut frames = VecFrames::new(vec![b"one".to_vec()]);
            let job = job(dir.path());
            let err = compositor
                .compose(&job, &mut frames, &CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                CompositorError::EncoderFailed { status, stderr } => {
                    assert_eq!(status, Some(1));
                    assert_eq!(stderr, "invalid filter");
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(!job.output.exists());
        }

        // Records its pid, leaves a partial output and hangs.
        const HANG_WITH_PARTIAL: &str =
            "echo $$ > \"$(dirname \"$0\")/encoder.pid\"\nfor last; do :; done\necho partial > \"$last\"\nexec sleep 30";

        fn assert_encoder_stopped(dir: &Path) {
            let pid = std::fs::read_to_string(dir.join("encoder.pid")).unwrap();
            let alive = std::process::Command::new("kill")
                .arg("-0")
                .arg(pid.trim())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(!alive.success(), "encoder {} still running", pid.trim());
        }

        #[tokio::test]
        async fn cancellation_removes_partial_output() {
            let dir = tempfile::tempdir().unwrap();
            let compositor = StreamingCompositor::new(
                fake_encoder(dir.path(), HANG_WITH_PARTIAL),
                EncoderSection {
                    terminate_grace_seconds: 1,
                    ..EncoderSection::default()
                },
            );
            let job = job(dir.path());
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });
            let err = compositor.compose(&job, &mut NoOverlay, &cancel).await.unwrap_err();
            assert!(matches!(err, CompositorError::Cancelled));
            assert!(!job.output.exists());
            assert_encoder_stopped(dir.path());
        }

        #[tokio::test]
        async fn timeout_stops_the_encoder_and_removes_partial_output() {
            let dir = tempfile::tempdir().unwrap();
            let compositor = StreamingCompositor::new(
                fake_encoder(dir.path(), HANG_WITH_PARTIAL),
                EncoderSection {
                    timeout_base_seconds: 1,
                    timeout_realtime_factor: 0.0,
                    terminate_grace_seconds: 1,
                    ..EncoderSection::default()
                },
            );
            let job = job(dir.path());
            let mut frames = VecFrames::new(vec![b"one".to_vec()]);
            let err = compositor
                .compose(&job, &mut frames, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, CompositorError::Timeout(limit) if limit == Duration::from_secs(1)));
            assert_eq!(err.class(), FailureClass::ResourceExceeded);
            assert!(!job.output.exists());
            assert!(frames.closed);
            assert_encoder_stopped(dir.path());
        }
    }
}
