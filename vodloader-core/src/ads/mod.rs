//! Ad-break detection from frame-property changes, and removal of the
//! detected breaks.

mod segments;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AdDetectionSection, EncoderSection, PathsSection};
use crate::error::{Classify, FailureClass};
use crate::probe::{MediaProbe, ProbeError};
use crate::process::{describe, run_checked, tail_lossy, CommandError, SystemCommandExecutor};

pub use segments::{
    main_properties, DetectionReport, FrameSample, MainProperties, SegmentBuilder, VideoSegment,
};

#[derive(Debug, Error)]
pub enum AdError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed reading probe output: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame probe failed with status {status:?}: {stderr}")]
    ProbeFailed { status: Option<i32>, stderr: String },
    #[error("frame probe timed out after {0:?}")]
    ProbeTimeout(Duration),
    #[error("no decodable video frames in {0}")]
    NoFrames(PathBuf),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to prepare work directory {path}: {source}")]
    WorkDir {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Classify for AdError {
    fn class(&self) -> FailureClass {
        match self {
            AdError::ProbeTimeout(_) | AdError::Command(CommandError::Timeout { .. }) => {
                FailureClass::ResourceExceeded
            }
            AdError::Io(_) => FailureClass::TransientIo,
            AdError::NoFrames(_) => FailureClass::DataInconsistency,
            AdError::Spawn { .. } | AdError::WorkDir { .. } => FailureClass::Internal,
            _ => FailureClass::CompositionFailure,
        }
    }
}

pub type AdResult<T> = Result<T, AdError>;

/// Outcome of [`AdDetector::remove_ads`]. `NoAds` means the caller keeps the
/// original file; nothing was written.
#[derive(Debug, Clone, PartialEq)]
pub enum AdRemoval {
    NoAds(DetectionReport),
    Removed {
        report: DetectionReport,
        output: PathBuf,
    },
}

impl AdRemoval {
    pub fn report(&self) -> &DetectionReport {
        match self {
            AdRemoval::NoAds(report) => report,
            AdRemoval::Removed { report, .. } => report,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdDetector {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    settings: AdDetectionSection,
    encoder: EncoderSection,
    probe: MediaProbe,
}

impl AdDetector {
    pub fn new(paths: &PathsSection, settings: &AdDetectionSection, encoder: &EncoderSection) -> Self {
        let probe_timeout = Duration::from_secs(settings.probe_timeout_seconds.max(1));
        Self {
            ffmpeg: paths.ffmpeg.clone(),
            ffprobe: paths.ffprobe.clone(),
            settings: settings.clone(),
            encoder: encoder.clone(),
            probe: MediaProbe::new(&paths.ffprobe, probe_timeout),
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.probe_timeout_seconds.max(1))
    }

    /// Streams per-frame properties out of ffprobe and classifies the
    /// resulting segments.
    pub async fn detect(&self, path: &Path) -> AdResult<DetectionReport> {
        info!(path = %path.display(), "analyzing frame properties");
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("frame=best_effort_timestamp_time,width,height")
            .arg("-of")
            .arg("csv=p=0")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let program = describe(&command);
        let mut child = command
            .spawn()
            .map_err(|source| AdError::Spawn { program, source })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdError::ProbeFailed {
                status: None,
                stderr: "stdout unavailable".into(),
            })?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer).await;
                buffer
            })
        });

        let limit = self.probe_timeout();
        let min_segment = self.settings.min_segment_seconds;
        let fold = async {
            let mut builder = SegmentBuilder::new(min_segment);
            let mut skipped = 0u64;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match FrameSample::parse_csv(&line) {
                    Some(sample) => builder.push(sample),
                    None if line.trim().is_empty() => {}
                    None => skipped += 1,
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((builder, skipped, status))
        };
        let (builder, skipped, status) = match timeout(limit, fold).await {
            Ok(result) => result?,
            Err(_) => return Err(AdError::ProbeTimeout(limit)),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            return Err(AdError::ProbeFailed {
                status: status.code(),
                stderr: tail_lossy(&stderr, 4096),
            });
        }
        if skipped > 0 {
            debug!(skipped, "skipped frames without usable properties");
        }
        let frames = builder.frames();
        let segments = builder.finish();
        let report = DetectionReport::classify(segments, self.settings.fps_tolerance)
            .ok_or_else(|| AdError::NoFrames(path.to_path_buf()))?;
        info!(
            path = %path.display(),
            frames,
            segments = report.segments.len(),
            ads = report.ads.len(),
            ad_seconds = report.ad_seconds(),
            main = %report.main,
            "frame analysis complete"
        );
        Ok(report)
    }

    /// Writes `output` with every ad break cut out. Returns
    /// [`AdRemoval::NoAds`] without touching the filesystem when the
    /// recording has none.
    pub async fn remove_ads(&self, input: &Path, output: &Path) -> AdResult<AdRemoval> {
        let report = self.detect(input).await?;
        if !report.has_ads() {
            info!(path = %input.display(), "no ads detected");
            return Ok(AdRemoval::NoAds(report));
        }
        let has_audio = self.probe.video_info(input).await?.has_audio;
        let ranges = report.content_ranges();
        let batch_size = self.settings.batch_size.max(1);
        info!(
            path = %input.display(),
            ranges = ranges.len(),
            batch_size,
            "removing ad segments"
        );

        let result = if ranges.len() <= batch_size {
            self.cut(input, &ranges, has_audio, output).await
        } else {
            self.cut_batched(input, &ranges, has_audio, batch_size, output)
                .await
        };
        if let Err(err) = result {
            remove_partial(output).await;
            return Err(err);
        }
        Ok(AdRemoval::Removed {
            report,
            output: output.to_path_buf(),
        })
    }

    async fn cut_batched(
        &self,
        input: &Path,
        ranges: &[(f64, f64)],
        has_audio: bool,
        batch_size: usize,
        output: &Path,
    ) -> AdResult<()> {
        let parent = output
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let workdir = tempfile::Builder::new()
            .prefix(".adcut-")
            .tempdir_in(parent)
            .map_err(|source| AdError::WorkDir {
                source,
                path: parent.to_path_buf(),
            })?;

        let mut list = String::new();
        for (index, batch) in ranges.chunks(batch_size).enumerate() {
            let batch_path = workdir.path().join(format!("batch_{index:03}.mp4"));
            debug!(batch = index, ranges = batch.len(), "encoding content batch");
            self.cut(input, batch, has_audio, &batch_path).await?;
            list.push_str(&concat_entry(&batch_path));
        }
        let list_path = workdir.path().join("batches.txt");
        tokio::fs::write(&list_path, list)
            .await
            .map_err(|source| AdError::WorkDir {
                source,
                path: list_path.clone(),
            })?;

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&list_path)
            .arg("-c")
            .arg("copy")
            .arg(output);
        let total: f64 = ranges.iter().map(|(start, end)| end - start).sum();
        run_checked(&SystemCommandExecutor, &mut command, self.encoder.timeout_for(total)).await?;
        // workdir and every batch file are removed when it drops
        Ok(())
    }

    async fn cut(
        &self,
        input: &Path,
        ranges: &[(f64, f64)],
        has_audio: bool,
        output: &Path,
    ) -> AdResult<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-filter_complex")
            .arg(trim_filter(ranges, has_audio))
            .arg("-map")
            .arg("[outv]");
        if has_audio {
            command.arg("-map").arg("[outa]").arg("-c:a").arg("aac");
        }
        command
            .arg("-c:v")
            .arg(&self.encoder.video_codec)
            .arg("-preset")
            .arg(&self.encoder.preset)
            .arg("-crf")
            .arg(self.encoder.crf.to_string())
            .arg(output);
        let total: f64 = ranges.iter().map(|(start, end)| end - start).sum();
        run_checked(&SystemCommandExecutor, &mut command, self.encoder.timeout_for(total)).await?;
        Ok(())
    }
}

/// `trim`/`atrim` per content range joined by one `concat`.
pub fn trim_filter(ranges: &[(f64, f64)], has_audio: bool) -> String {
    let mut parts = Vec::with_capacity(ranges.len() * 2 + 1);
    let mut inputs = String::new();
    for (index, (start, end)) in ranges.iter().enumerate() {
        parts.push(format!(
            "[0:v]trim=start={start:.6}:end={end:.6},setpts=PTS-STARTPTS[v{index}]"
        ));
        inputs.push_str(&format!("[v{index}]"));
        if has_audio {
            parts.push(format!(
                "[0:a]atrim=start={start:.6}:end={end:.6},asetpts=PTS-STARTPTS[a{index}]"
            ));
            inputs.push_str(&format!("[a{index}]"));
        }
    }
    let outputs = if has_audio { "[outv][outa]" } else { "[outv]" };
    parts.push(format!(
        "{inputs}concat=n={}:v=1:a={}{outputs}",
        ranges.len(),
        u8::from(has_audio)
    ));
    parts.join(";")
}

fn concat_entry(path: &Path) -> String {
    let escaped = path.display().to_string().replace('\'', "'\\''");
    format!("file '{escaped}'\n")
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

    #[test]
    fn filter_interleaves_audio_and_video() {
        let filter = trim_filter(&[(0.0, 100.0), (110.0, 400.0)], true);
        assert_eq!(
            filter,
            "[0:v]trim=start=0.000000:end=100.000000,setpts=PTS-STARTPTS[v0];\
             [0:a]atrim=start=0.000000:end=100.000000,asetpts=PTS-STARTPTS[a0];\
             [0:v]trim=start=110.000000:end=400.000000,setpts=PTS-STARTPTS[v1];\
             [0:a]atrim=start=110.000000:end=400.000000,asetpts=PTS-STARTPTS[a1];\
             [v0][a0][v1][a1]concat=n=2:v=1:a=1[outv][outa]"
        );
    }

    #[test]
    fn filter_without_audio_skips_atrim() {
        let filter = trim_filter(&[(1.5, 2.5)], false);
        assert!(!filter.contains("atrim"));
        assert!(filter.ends_with("[v0]concat=n=1:v=1:a=0[outv]"));
    }

    #[test]
    fn concat_list_escapes_quotes() {
        assert_eq!(
            concat_entry(Path::new("/tmp/it's.mp4")),
            "file '/tmp/it'\\''s.mp4'\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn constant_trace_from_probe_is_left_alone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffprobe");
        let mut body = String::from("#!/bin/sh\n");
        for index in 0..90 {
            body.push_str(&format!("echo '{:.6},1920,1080'\n", index as f64 / 30.0));
        }
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let paths = PathsSection {
            ffprobe: script,
            ..PathsSection::default()
        };
        let detector = AdDetector::new(&paths, &AdDetectionSection::default(), &EncoderSection::default());
        let input = dir.path().join("part.ts");
        std::fs::write(&input, b"ts").unwrap();
        let output = dir.path().join("part.no_ads.mp4");
        let removal = detector.remove_ads(&input, &output).await.unwrap();
        assert!(matches!(removal, AdRemoval::NoAds(_)));
        assert!(!output.exists());
        assert_eq!(removal.report().main.fps, 30);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn many_ranges_are_cut_in_batches_and_joined() {
        use std::os::unix::fs::PermissionsExt;

        fn executable(path: &Path, body: &str) {
            std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        // content, ad, content, ad, content at 30fps
        let layout = [
            (0.0, 3.0, "1920,1080"),
            (3.0, 5.0, "1280,720"),
            (5.0, 8.0, "1920,1080"),
            (8.0, 10.0, "1280,720"),
            (10.0, 13.0, "1920,1080"),
        ];
        let mut frames = String::new();
        for (from, to, size) in layout {
            let count = ((to - from) * 30.0_f64).round() as u32;
            for index in 0..count {
                frames.push_str(&format!("{:.6},{size}\n", from + f64::from(index) / 30.0));
            }
        }
        let ffprobe = dir.path().join("fake-ffprobe");
        executable(
            &ffprobe,
            &format!(
                "case \"$*\" in\n*csv=p=0*) cat <<'EOF'\n{frames}EOF\n;;\n*) cat <<'EOF'\n\
                 {{\"streams\":[{{\"codec_type\":\"video\",\"width\":1920,\"height\":1080,\"avg_frame_rate\":\"30/1\"}},{{\"codec_type\":\"audio\"}}],\"format\":{{\"duration\":\"13.0\"}}}}\n\
                 EOF\n;;\nesac"
            ),
        );
        let calls = dir.path().join("calls.log");
        let ffmpeg = dir.path().join("fake-ffmpeg");
        executable(
            &ffmpeg,
            &format!(
                "prev=\"\"; list=\"\"\n\
                 for arg; do [ \"$prev\" = \"-i\" ] && list=\"$arg\"; prev=\"$arg\"; last=\"$arg\"; done\n\
                 echo call >> '{}'\n\
                 case \"$*\" in\n*\"-f concat\"*) cat \"$list\" > \"$last\" ;;\n*) printf batch > \"$last\" ;;\nesac",
                calls.display()
            ),
        );

        let paths = PathsSection {
            ffmpeg,
            ffprobe,
            ..PathsSection::default()
        };
        let settings = AdDetectionSection {
            batch_size: 2,
            ..AdDetectionSection::default()
        };
        let detector = AdDetector::new(&paths, &settings, &EncoderSection::default());
        let input = dir.path().join("part.ts");
        std::fs::write(&input, b"ts").unwrap();
        let output = dir.path().join("part.no_ads.mp4");

        let removal = detector.remove_ads(&input, &output).await.unwrap();
        assert_eq!(removal.report().ads.len(), 2);
        assert_eq!(removal.report().content_ranges().len(), 3);
        assert!(matches!(removal, AdRemoval::Removed { .. }));

        // two batch encodes plus the final join
        let invocations = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(invocations.lines().count(), 3);
        let joined = std::fs::read_to_string(&output).unwrap();
        assert_eq!(joined.lines().count(), 2);
        assert!(joined.contains("batch_000.mp4") && joined.contains("batch_001.mp4"));

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".adcut-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
